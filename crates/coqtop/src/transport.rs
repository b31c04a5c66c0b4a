//! Loopback channels between the session and coqtop.
//!
//! coqtop connects back to listeners we open, one connection per listener.
//! In the shared layout each channel is one duplex socket; in the split
//! layout (used on Windows) each channel is a read socket plus a write socket,
//! and the listener addresses are passed as `host:portR:portW`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::types::CoqError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    /// One socket per channel (2 listeners).
    Shared,
    /// Separate read and write sockets per channel (4 listeners).
    Split,
}

impl ChannelLayout {
    /// Layout coqtop expects on this platform.
    pub fn native() -> Self {
        if cfg!(windows) {
            ChannelLayout::Split
        } else {
            ChannelLayout::Shared
        }
    }
}

/// Bound, not yet accepted, listeners.
pub struct Listeners {
    layout: ChannelLayout,
    main: Vec<TcpListener>,
    control: Vec<TcpListener>,
}

/// The connected channels.
pub struct Channels {
    /// Where protocol events are read from.
    pub main_reader: BoxedReader,
    /// Where calls are written to.
    pub main_writer: BoxedWriter,
    /// Other inbound halves; only logged.
    pub passive: Vec<(&'static str, BoxedReader)>,
    /// Outbound halves nothing writes to; held so the sockets stay open.
    pub idle_writers: Vec<BoxedWriter>,
}

impl Listeners {
    /// Bind the listeners for `layout` on ephemeral ports.
    pub async fn bind(host: &str, layout: ChannelLayout) -> Result<Self, CoqError> {
        let count = match layout {
            ChannelLayout::Shared => 1,
            ChannelLayout::Split => 2,
        };
        let mut main = Vec::with_capacity(count);
        let mut control = Vec::with_capacity(count);
        for _ in 0..count {
            main.push(TcpListener::bind((host, 0)).await?);
            control.push(TcpListener::bind((host, 0)).await?);
        }
        Ok(Self {
            layout,
            main,
            control,
        })
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    /// `-main-channel` argument.
    pub fn main_arg(&self) -> Result<String, CoqError> {
        channel_arg(&self.main)
    }

    /// `-control-channel` argument.
    pub fn control_arg(&self) -> Result<String, CoqError> {
        channel_arg(&self.control)
    }

    /// Accept exactly one connection per listener within `deadline`.
    ///
    /// Listeners are dropped afterwards, so later connection attempts are
    /// refused.
    pub async fn accept(self, deadline: Duration) -> Result<Channels, CoqError> {
        let millis = deadline.as_millis() as u64;
        tokio::time::timeout(deadline, self.accept_all())
            .await
            .map_err(|_| CoqError::Timeout {
                call: "accept",
                millis,
            })?
    }

    async fn accept_all(self) -> Result<Channels, CoqError> {
        let mut main = Vec::new();
        for listener in &self.main {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "Main channel connected");
            main.push(stream);
        }
        let mut control = Vec::new();
        for listener in &self.control {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "Control channel connected");
            control.push(stream);
        }

        let mut passive: Vec<(&'static str, BoxedReader)> = Vec::new();
        let mut idle_writers: Vec<BoxedWriter> = Vec::new();
        let mut main = main.into_iter();
        let mut control = control.into_iter();
        let missing = || CoqError::Protocol("listener accepted no connection".into());

        let (main_reader, main_writer): (BoxedReader, BoxedWriter) = match self.layout {
            ChannelLayout::Shared => {
                let (r, w) = main.next().ok_or_else(missing)?.into_split();
                let (cr, cw) = control.next().ok_or_else(missing)?.into_split();
                passive.push(("control", Box::new(cr)));
                idle_writers.push(Box::new(cw));
                (Box::new(r), Box::new(w))
            }
            ChannelLayout::Split => {
                let (r, rw) = main.next().ok_or_else(missing)?.into_split();
                let (wr, w) = main.next().ok_or_else(missing)?.into_split();
                passive.push(("main W", Box::new(wr)));
                idle_writers.push(Box::new(rw));
                for name in ["control R", "control W"] {
                    let (cr, cw) = control.next().ok_or_else(missing)?.into_split();
                    passive.push((name, Box::new(cr)));
                    idle_writers.push(Box::new(cw));
                }
                (Box::new(r), Box::new(w))
            }
        };

        Ok(Channels {
            main_reader,
            main_writer,
            passive,
            idle_writers,
        })
    }
}

fn channel_arg(listeners: &[TcpListener]) -> Result<String, CoqError> {
    let mut addrs = listeners.iter().map(|l| l.local_addr());
    let first = addrs
        .next()
        .ok_or_else(|| CoqError::Protocol("no listener bound".into()))??;
    let mut arg = format!("{}:{}", first.ip(), first.port());
    for addr in addrs {
        arg.push_str(&format!(":{}", addr?.port()));
    }
    Ok(arg)
}

/// Log whatever arrives on a channel nobody else reads.
pub fn spawn_logger(name: &'static str, mut reader: BoxedReader) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    tracing::debug!(channel = name, data = %String::from_utf8_lossy(&buf[..n]), "Channel data");
                }
                Err(e) => {
                    tracing::debug!(channel = name, error = %e, "Channel read failed");
                    break;
                }
            }
        }
    })
}
