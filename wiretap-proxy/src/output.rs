use crossbeam_channel::{Receiver, Sender, unbounded};

/// Destination for the engine's human-readable status lines.
///
/// Every state transition and every absorbed error produces at least one
/// line; an empty batch means "nothing to display" and is dropped. Called
/// from any of an endpoint's threads, so implementations must stay cheap.
pub trait OutputSink: Send + Sync {
    fn emit(&self, lines: Vec<String>);

    fn emit_line(&self, line: String) {
        self.emit(vec![line]);
    }
}

pub type OutputLines = Receiver<Vec<String>>;

/// Sink that forwards line batches onto a channel for a consumer thread.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<Vec<String>>,
}

pub fn output_channel() -> (ChannelSink, OutputLines) {
    let (sender, receiver) = unbounded();
    (ChannelSink { sender }, receiver)
}

impl OutputSink for ChannelSink {
    fn emit(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let _ = self.sender.send(lines);
    }
}

#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn emit(&self, lines: Vec<String>) {
        for line in lines {
            println!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OutputSink, output_channel};

    #[test]
    fn channel_sink_delivers_batches() {
        let (sink, lines) = output_channel();
        sink.emit(vec!["first".to_string(), "second".to_string()]);
        sink.emit_line("third".to_string());
        assert_eq!(lines.recv().unwrap(), vec!["first", "second"]);
        assert_eq!(lines.recv().unwrap(), vec!["third"]);
    }

    #[test]
    fn empty_batches_are_dropped() {
        let (sink, lines) = output_channel();
        sink.emit(Vec::new());
        sink.emit_line("only".to_string());
        assert_eq!(lines.recv().unwrap(), vec!["only"]);
        assert!(lines.try_recv().is_err());
    }
}
