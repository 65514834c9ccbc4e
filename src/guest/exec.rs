//! Interactive exec sessions.

use tokio::io::{ReadHalf, WriteHalf};

use crate::backend::BoxedStream;
use crate::error::{Error, Result};
use crate::guest::protocol::{
    read_message, write_message, Command, ExecExit, ExecOutput, ExecSignal, ExecStart,
    ExecStdin, Message, MessageType, OutputStream,
};

/// Something the process did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Output { stream: OutputStream, data: Vec<u8> },
    Exit(ExecExit),
}

/// Everything a finished session produced.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: i32,
    /// Set when the process could not be started or waited for.
    pub error: Option<String>,
}

/// One process whose stdio is carried by a dedicated connection.
///
/// The reading and writing sides are independent, so stdin can be fed
/// while output is being drained.
pub struct ExecSession {
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
    finished: bool,
}

impl ExecSession {
    pub(crate) async fn start(mut stream: BoxedStream, command: Command) -> Result<Self> {
        let start = Message::json(MessageType::ExecStart, &ExecStart { command })?;
        write_message(&mut stream, &start).await?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader,
            writer,
            finished: false,
        })
    }

    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        let msg = Message::json(
            MessageType::ExecStdin,
            &ExecStdin {
                data: data.to_vec(),
            },
        )?;
        write_message(&mut self.writer, &msg).await
    }

    pub async fn close_stdin(&mut self) -> Result<()> {
        write_message(&mut self.writer, &Message::empty(MessageType::ExecStdinClose)).await
    }

    pub async fn signal(&mut self, signal: i32) -> Result<()> {
        let msg = Message::json(MessageType::ExecSignal, &ExecSignal { signal })?;
        write_message(&mut self.writer, &msg).await
    }

    /// Next output chunk or the exit status. `None` after the exit.
    pub async fn next_event(&mut self) -> Result<Option<ExecEvent>> {
        if self.finished {
            return Ok(None);
        }
        let msg = read_message(&mut self.reader).await?;
        match msg.msg_type {
            MessageType::ExecOutput => {
                let chunk: ExecOutput = msg.decode()?;
                Ok(Some(ExecEvent::Output {
                    stream: chunk.stream,
                    data: chunk.data,
                }))
            }
            MessageType::ExecExit => {
                self.finished = true;
                Ok(Some(ExecEvent::Exit(msg.decode()?)))
            }
            other => Err(Error::Guest(format!(
                "unexpected {:?} in exec session",
                other
            ))),
        }
    }

    /// Close stdin and collect output until the process exits.
    pub async fn wait_with_output(mut self) -> Result<ExecResult> {
        self.close_stdin().await?;
        let mut result = ExecResult::default();
        while let Some(event) = self.next_event().await? {
            match event {
                ExecEvent::Output {
                    stream: OutputStream::Stdout,
                    data,
                } => result.stdout.extend(data),
                ExecEvent::Output {
                    stream: OutputStream::Stderr,
                    data,
                } => result.stderr.extend(data),
                ExecEvent::Exit(exit) => {
                    result.exit = exit.exit;
                    result.error = exit.error;
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn output_is_split_by_stream() {
        let (host, mut guest) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let start = read_message(&mut guest).await.unwrap();
            let start: ExecStart = start.decode().unwrap();
            assert_eq!(start.command.path, "/bin/ls");
            let close = read_message(&mut guest).await.unwrap();
            assert_eq!(close.msg_type, MessageType::ExecStdinClose);
            for (stream, data) in [
                (OutputStream::Stdout, b"a\n".to_vec()),
                (OutputStream::Stderr, b"oops\n".to_vec()),
                (OutputStream::Stdout, b"b\n".to_vec()),
            ] {
                let msg =
                    Message::json(MessageType::ExecOutput, &ExecOutput { stream, data }).unwrap();
                write_message(&mut guest, &msg).await.unwrap();
            }
            let exit = ExecExit {
                exit: 2,
                error: None,
            };
            write_message(
                &mut guest,
                &Message::json(MessageType::ExecExit, &exit).unwrap(),
            )
            .await
            .unwrap();
        });

        let session = ExecSession::start(Box::new(host), Command::new("/bin/ls"))
            .await
            .unwrap();
        let result = session.wait_with_output().await.unwrap();
        server.await.unwrap();
        assert_eq!(result.stdout, b"a\nb\n");
        assert_eq!(result.stderr, b"oops\n");
        assert_eq!(result.exit, 2);
    }

    #[tokio::test]
    async fn stdin_and_signals_are_framed() {
        let (host, mut guest) = tokio::io::duplex(4096);
        let mut session = ExecSession::start(Box::new(host), Command::new("cat"))
            .await
            .unwrap();
        session.write_stdin(b"hello").await.unwrap();
        session.signal(15).await.unwrap();

        assert_eq!(
            read_message(&mut guest).await.unwrap().msg_type,
            MessageType::ExecStart
        );
        let stdin: ExecStdin = read_message(&mut guest).await.unwrap().decode().unwrap();
        assert_eq!(stdin.data, b"hello");
        let signal: ExecSignal = read_message(&mut guest).await.unwrap().decode().unwrap();
        assert_eq!(signal.signal, 15);
    }
}
