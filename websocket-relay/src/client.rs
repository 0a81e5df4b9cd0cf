use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
};
use tokio_tungstenite::{WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::cli::ClientArgs;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (socket, _) = connect_async(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let mut stdout = tokio::io::stdout();
    write_line(&mut stdout, &format!("*** connected to {}", args.server)).await?;

    session(socket, BufReader::new(tokio::io::stdin()), stdout).await
}

/// Sends each input line as a text frame and writes every relayed frame to
/// `output` until `/quit`, end of input, ctrl-c or the relay closing.
async fn session<S, R, W>(socket: WebSocketStream<S>, input: R, mut output: W) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    // `next_line` keeps a partially typed line across loop iterations.
    let mut lines = input.lines();

    loop {
        select! {
            message = stream.next() => {
                let Some(message) = message else {
                    write_line(&mut output, "*** relay closed the connection").await?;
                    break;
                };
                let message = message.context("failed to read from relay")?;
                if !render_message(message, &mut output).await? {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let text = line.trim_end_matches('\r');
                if text.eq_ignore_ascii_case("/quit") {
                    write_line(&mut output, "*** leaving relay").await?;
                    break;
                }
                if !text.is_empty() {
                    sink.send(Message::Text(text.to_string()))
                        .await
                        .context("failed to send message")?;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = sink.close().await {
        warn!(?error, "failed to close relay connection cleanly");
    }

    Ok(())
}

/// Prints one relayed message. Returns `false` once the relay closes the session.
async fn render_message<W>(message: Message, output: &mut W) -> io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match message {
        Message::Text(text) => write_line(output, &text).await?,
        Message::Binary(bytes) => write_line(output, &format!("<{} bytes>", bytes.len())).await?,
        Message::Close(_) => {
            write_line(output, "*** relay closed the connection").await?;
            return Ok(false);
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
    }
    Ok(true)
}

async fn write_line<W>(output: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
