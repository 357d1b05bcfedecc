use std::sync::Arc;

use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use wiretap_proxy::{EndpointConfig, Passthrough, StdoutSink};
use wiretap_registry::ProxyRegistry;

#[derive(Debug, Parser)]
#[command(name = "wiretap-proxy-cli")]
struct Cli {
    /// Address to bind the listening sockets on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Proxy definition, repeatable to run several proxies at once.
    #[arg(long = "proxy", value_name = "LPORT:RHOST:RPORT", required = true)]
    proxies: Vec<String>,
}

fn main() -> Result<(), String> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let sink = Arc::new(StdoutSink);
    let mut registry = ProxyRegistry::new();

    for (index, spec) in cli.proxies.iter().enumerate() {
        let (local_port, remote_host, remote_port) = parse_proxy_spec(spec)?;
        let name = format!("proxy{index}");
        let config = EndpointConfig::new(
            name.clone(),
            cli.bind.clone(),
            local_port,
            remote_host.clone(),
            remote_port,
        );
        registry
            .create(config, Arc::new(Passthrough::default()), sink.clone())
            .map_err(|err| err.to_string())?;
        info!("{name}: {}:{local_port} -> {remote_host}:{remote_port}", cli.bind);
    }

    // Runs until killed; the interactive shell lives outside this binary.
    registry.join_all();
    Ok(())
}

fn parse_proxy_spec(spec: &str) -> Result<(u16, String, u16), String> {
    let mut parts = spec.splitn(3, ':');
    let local_port = parts
        .next()
        .ok_or_else(|| format!("invalid proxy spec: {spec}"))?
        .parse::<u16>()
        .map_err(|err| format!("invalid local port in {spec}: {err}"))?;
    let remote_host = parts
        .next()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| format!("missing remote host in {spec}"))?
        .to_string();
    let remote_port = parts
        .next()
        .ok_or_else(|| format!("missing remote port in {spec}"))?
        .parse::<u16>()
        .map_err(|err| format!("invalid remote port in {spec}: {err}"))?;
    Ok((local_port, remote_host, remote_port))
}

#[cfg(test)]
mod tests {
    use super::parse_proxy_spec;

    #[test]
    fn parses_full_spec() {
        let parsed = parse_proxy_spec("4000:example.com:4001").unwrap();
        assert_eq!(parsed, (4000, "example.com".to_string(), 4001));
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(parse_proxy_spec("4000").is_err());
        assert!(parse_proxy_spec("4000:host").is_err());
        assert!(parse_proxy_spec("nope:host:4001").is_err());
        assert!(parse_proxy_spec("4000::4001").is_err());
    }
}
