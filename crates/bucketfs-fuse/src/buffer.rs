//! Background-filled buffer over a lazily opened byte stream.
//!
//! A single fill task opens the source once and copies it into an [`MBuf`]
//! until the buffer is full or the stream ends. Readers wait until the stream
//! is open, drain the buffer, and then continue directly from the stream.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{FsError, Result};
use crate::mbuf::MBuf;
use crate::store::{BoxFuture, ByteStream};

/// Deferred stream open, run on the fill task.
pub type StreamOpener = BoxFuture<'static, Result<ByteStream>>;

struct BufferState {
    mbuf: Option<MBuf>,
    reader: Option<ByteStream>,
    err: Option<FsError>,
    opened: bool,
}

struct Shared {
    state: Mutex<BufferState>,
    opened: Notify,
}

pub struct AsyncBuffer {
    shared: Arc<Shared>,
    fill: Option<JoinHandle<()>>,
}

impl AsyncBuffer {
    /// Starts filling `mbuf` from the stream produced by `open`.
    pub fn new(mbuf: MBuf, open: StreamOpener) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(BufferState {
                mbuf: Some(mbuf),
                reader: None,
                err: None,
                opened: false,
            }),
            opened: Notify::new(),
        });
        let fill = tokio::spawn(fill_loop(Arc::clone(&shared), open));
        Self {
            shared,
            fill: Some(fill),
        }
    }

    /// Reads into `dst`, waiting for the stream to open if necessary.
    ///
    /// Returns 0 at end of stream.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let mut st = loop {
            let opened = self.shared.opened.notified();
            let st = self.shared.state.lock().await;
            if st.opened {
                break st;
            }
            drop(st);
            opened.await;
        };

        if let Some(err) = &st.err {
            return Err(err.clone());
        }

        if let Some(mbuf) = st.mbuf.as_mut() {
            let n = mbuf.read(dst);
            if n > 0 {
                return Ok(n);
            }
            // everything the fill task wrote has been consumed, so the live
            // stream is positioned exactly where the caller expects
            st.mbuf = None;
        }

        match st.reader.as_mut() {
            Some(reader) => reader
                .read(dst)
                .await
                .map_err(|e| FsError::Io { msg: e.to_string() }),
            None => Ok(0),
        }
    }

    /// Stops the fill task and releases the buffer and stream.
    pub async fn close(&mut self) {
        if let Some(fill) = self.fill.take() {
            fill.abort();
        }
        let mut st = self.shared.state.lock().await;
        if let Some(mut mbuf) = st.mbuf.take() {
            mbuf.free();
        }
        st.reader = None;
    }
}

impl Drop for AsyncBuffer {
    fn drop(&mut self) {
        if let Some(fill) = self.fill.take() {
            fill.abort();
        }
    }
}

async fn fill_loop(shared: Arc<Shared>, open: StreamOpener) {
    let opened = open.await;
    {
        let mut st = shared.state.lock().await;
        match opened {
            Ok(reader) => st.reader = Some(reader),
            Err(e) => {
                debug!("buffer stream open failed: {}", e);
                st.err = Some(e);
            }
        }
        st.opened = true;
    }
    shared.opened.notify_waiters();

    loop {
        {
            let mut st = shared.state.lock().await;
            let BufferState { mbuf, reader, err, .. } = &mut *st;
            let (Some(mbuf), Some(reader)) = (mbuf.as_mut(), reader.as_mut()) else {
                return;
            };
            match mbuf.write_from(reader).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) => {
                    debug!("buffer fill failed: {}", e);
                    *err = Some(FsError::Io { msg: e.to_string() });
                    return;
                }
            }
        }
        tokio::task::yield_now().await;
    }
}
