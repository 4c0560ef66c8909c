//! Per-connection text engine loop: read into a buffer, parse as many complete
//! commands as are already buffered, dispatch each to the store, write the reply,
//! and only then read more. Grounded on the source's per-connection task: accept,
//! loop { read → parse → {lock store, execute} → compose → write }.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use memc_protocol::command::Op;
use memc_protocol::response::Response;
use memc_protocol::text::{self, ParseError};
use memc_store::Store;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

pub async fn handle(mut stream: TcpStream, store: Arc<Store>, mut read_buf: BytesMut, slowdown: Duration) {
    let mut write_buf = BytesMut::new();
    let mut scratch = [0u8; 4096];

    loop {
        loop {
            match text::parse_command(&read_buf) {
                Ok((cmd, consumed)) => {
                    read_buf.advance(consumed);
                    let quitting = cmd.op == Op::Quit;
                    let response = store.execute(&cmd);

                    if !cmd.noreply {
                        text::compose_response(&response, &mut write_buf);
                    }
                    if !write_buf.is_empty() {
                        if stream.write_all(&write_buf).await.is_err() {
                            return;
                        }
                        write_buf.clear();
                    }

                    if quitting || matches!(response, Response::Hangup) {
                        let _ = stream.shutdown().await;
                        return;
                    }

                    if !slowdown.is_zero() {
                        tokio::time::sleep(slowdown).await;
                    }
                }
                Err(ParseError::Incomplete) => break,
            }
        }

        match stream.read(&mut scratch).await {
            Ok(0) => return,
            Ok(n) => read_buf.extend_from_slice(&scratch[..n]),
            Err(e) => {
                debug!(error = %e, "text connection read failed");
                return;
            }
        }
    }
}
