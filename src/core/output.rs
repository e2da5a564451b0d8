use std::io::{self, BufRead, BufReader, Read};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn thread_name(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout-reader",
            StreamKind::Stderr => "stderr-reader",
        }
    }
}

/// One complete line of child output, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// The set of receivers that get every line from every stream. Receivers that have been dropped
/// are forgotten the next time a line is published.
#[derive(Clone, Default)]
pub struct Subscribers(Arc<Mutex<Vec<Sender<OutputLine>>>>);

impl Subscribers {
    pub fn subscribe(&self) -> Receiver<OutputLine> {
        let (sender, receiver) = channel();
        self.0.lock().unwrap().push(sender);
        receiver
    }

    fn publish(&self, line: OutputLine) {
        let mut senders = self.0.lock().unwrap();
        senders.retain(|sender| sender.send(line.clone()).is_ok());
    }
}

/// Reads one pipe of a child process on its own thread, keeping the full text and pushing each
/// line to the subscribers as soon as it's complete. Lines of one stream arrive in order; there
/// is no ordering between the stdout and stderr streams.
pub struct OutputStream {
    stream: StreamKind,
    reader: JoinHandle<io::Result<String>>,
}

impl OutputStream {
    pub fn capture<R>(stream: StreamKind, source: R, subscribers: Subscribers) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let reader = std::thread::Builder::new()
            .name(stream.thread_name().to_string())
            .spawn(move || read_lines(stream, source, &subscribers))?;
        Ok(OutputStream { stream, reader })
    }

    /// Waits for the pipe to close and returns everything that was read from it.
    pub fn finish(self) -> io::Result<String> {
        let stream = self.stream;
        self.reader.join().map_err(|_| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("{:?} reader thread panicked", stream),
            )
        })?
    }
}

fn read_lines<R: Read>(stream: StreamKind, source: R, subscribers: &Subscribers) -> io::Result<String> {
    let mut reader = BufReader::new(source);
    let mut captured = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        // wperf writes UTF-8, but a stray byte shouldn't cost us the whole run
        let text = String::from_utf8_lossy(&buf);
        captured.push_str(&text);
        let line = text.trim_end_matches(|c| c == '\n' || c == '\r');
        subscribers.publish(OutputLine {
            stream,
            text: line.to_string(),
        });
    }
    Ok(captured)
}
