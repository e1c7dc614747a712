//! Per-connection protocol driver: reads command lines, dispatches them
//! against the [`Broker`], and writes responses back.

use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use crate::error::BrokerError;
use crate::line_reader::LineReader;
use crate::parser::ParsingError;
use crate::scheduler::{Broker, Reservation};
use crate::session::{IgnoreOutcome, SessionId};
use crate::types::protocol::{WireCommand, WireResponse};
use crate::types::serialisable::WireSerialise;
use crate::util::bytes_to_human_str;

/// Serves one connection until the peer quits, the stream ends, or
/// `cancel` fires. Opens a session on entry and always tears it down on
/// exit, so reservations held by a dropped connection go back to their
/// tubes.
pub async fn handle_conn<T>(
    broker: &Broker,
    cancel: CancellationToken,
    conn: &mut T,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let session = broker.open_session();

    let (r, w) = tokio::io::split(conn);
    let r: LineReader<_> = r.into();

    let ret = serve(broker, &cancel, session, r, w).await;

    if let Err(error) = broker.on_session_closed(session) {
        warn!(%error, "session teardown failed");
    }

    ret
}

async fn serve<R, W>(
    broker: &Broker,
    cancel: &CancellationToken,
    session: SessionId,
    mut r: LineReader<R>,
    mut w: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = select!(
            x = r.read_line() => match x? {
                Some(x) => x,
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        );

        trace!(line = bytes_to_human_str(&line), "processing command");

        let cmd: Result<WireCommand, ParsingError> =
            (&line as &[u8]).try_into();

        let resp = match cmd {
            Ok(WireCommand::Quit) => return Ok(()),
            Ok(cmd) => match dispatch(broker, cancel, session, &mut r, cmd).await? {
                Some(resp) => resp,
                // Cancelled or the peer went away mid-command.
                None => return Ok(()),
            },
            Err(error) => {
                let out = error.serialise_wire();
                select! {
                    x = w.write_all(&out) => x?,
                    _ = cancel.cancelled() => return Ok(()),
                }
                select! {
                    x = w.flush() => x?,
                    _ = cancel.cancelled() => return Ok(()),
                };
                continue;
            },
        };

        let out = resp.serialise_wire();
        select! {
            x = w.write_all(&out) => x?,
            _ = cancel.cancelled() => return Ok(()),
        }

        // Flush buffered responses so pipelined requests get pipelined
        // replies. flush() is a no-op on TcpStream but matters for other
        // transports.
        select! {
            x = w.flush() => x?,
            _ = cancel.cancelled() => return Ok(()),
        };
    }
}

/// Runs one parsed command to completion. Returns None when the
/// connection should close without a response.
async fn dispatch<R>(
    broker: &Broker,
    cancel: &CancellationToken,
    session: SessionId,
    r: &mut LineReader<R>,
    cmd: WireCommand,
) -> Result<Option<WireResponse>>
where
    R: AsyncRead + Unpin,
{
    use WireCommand::*;

    let resp = match cmd {
        Put { pri, delay, ttr, n_bytes } => {
            // The payload plus its CRLF is consumed whatever happens, so
            // a rejected put doesn't desynchronise the stream.
            let body = select! {
                x = r.read_exact(n_bytes as usize + 2) => match x? {
                    Some(x) => x,
                    None => return Ok(None),
                },
                _ = cancel.cancelled() => return Ok(None),
            };
            if !body.ends_with(b"\r\n") {
                WireResponse::ExpectedCrlf
            } else {
                let data = body.slice(0..body.len() - 2);
                let res = broker.tube_used(session).and_then(|tube| {
                    broker.put(
                        &tube,
                        pri,
                        Duration::from_secs(delay.into()),
                        Duration::from_secs(ttr.into()),
                        data,
                    )
                });
                match res {
                    Ok(id) => WireResponse::Inserted { id },
                    Err(BrokerError::InvalidArgument(_)) => WireResponse::JobTooBig,
                    Err(e) => render_err(e),
                }
            }
        },

        // Both reserve forms also watch the read half: a peer that hangs
        // up mid-reserve must free its session rather than silently take
        // the next job. Nothing is mutated until a job is actually taken,
        // so abandoning the pending reserve here is safe.
        Reserve => {
            let res = select! {
                x = broker.reserve(session, None) => x,
                x = r.closed() => {
                    x?;
                    return Ok(None);
                },
                _ = cancel.cancelled() => return Ok(None),
            };
            render_reservation(res)
        },
        ReserveWithTimeout { timeout } => {
            let res = select! {
                x = broker.reserve(
                    session,
                    Some(Duration::from_secs(timeout.into())),
                ) => x,
                x = r.closed() => {
                    x?;
                    return Ok(None);
                },
                _ = cancel.cancelled() => return Ok(None),
            };
            render_reservation(res)
        },

        Release { id, pri, delay } => {
            match broker.release(session, id, pri, Duration::from_secs(delay.into())) {
                Ok(()) => WireResponse::Released,
                Err(e) => render_err(e),
            }
        },
        Delete { id } => match broker.delete(Some(session), id) {
            Ok(()) => WireResponse::Deleted,
            Err(e) => render_err(e),
        },
        Bury { id, pri } => match broker.bury(session, id, pri) {
            Ok(()) => WireResponse::Buried,
            Err(e) => render_err(e),
        },
        Touch { id } => match broker.touch(session, id) {
            Ok(()) => WireResponse::Touched,
            Err(e) => render_err(e),
        },

        Kick { bound } => {
            let res = broker
                .tube_used(session)
                .and_then(|tube| broker.kick(&tube, bound));
            match res {
                Ok(count) => WireResponse::KickedCount { count },
                Err(e) => render_err(e),
            }
        },
        KickJob { id } => match broker.kick_job(id) {
            Ok(()) => WireResponse::Kicked,
            Err(e) => render_err(e),
        },

        Watch { tube } => match broker.watch(session, &tube) {
            Ok(count) => WireResponse::Watching { count },
            Err(e) => render_err(e),
        },
        Ignore { tube } => match broker.ignore(session, &tube) {
            Ok(
                IgnoreOutcome::Ignored(count) | IgnoreOutcome::NotWatched(count),
            ) => WireResponse::Watching { count },
            Ok(IgnoreOutcome::LastTube) => WireResponse::NotIgnored,
            Err(e) => render_err(e),
        },
        Use { tube } => match broker.use_tube(session, &tube) {
            Ok(()) => WireResponse::Using { tube },
            Err(e) => render_err(e),
        },

        Peek { id } => match broker.peek(id) {
            Ok(data) => WireResponse::Found { id, data },
            Err(e) => render_err(e),
        },
        // A missing or empty tube both read as "nothing to peek".
        PeekReady => render_peeked(
            broker.tube_used(session).and_then(|t| broker.peek_ready(&t)),
        ),
        PeekDelayed => render_peeked(
            broker.tube_used(session).and_then(|t| broker.peek_delayed(&t)),
        ),
        PeekBuried => render_peeked(
            broker.tube_used(session).and_then(|t| broker.peek_buried(&t)),
        ),

        ListTubes => WireResponse::OkTubeList { tubes: broker.list_tubes() },
        ListTubeUsed => match broker.tube_used(session) {
            Ok(tube) => WireResponse::Using { tube },
            Err(e) => render_err(e),
        },
        ListTubesWatched => match broker.list_tubes_watched(session) {
            Ok(tubes) => WireResponse::OkTubeList { tubes },
            Err(e) => render_err(e),
        },

        // Handled by the caller before dispatch.
        Quit => return Ok(None),
    };

    Ok(Some(resp))
}

fn render_reservation(res: crate::error::Result<Reservation>) -> WireResponse {
    match res {
        Ok(Reservation::Job { id, data }) => WireResponse::Reserved { id, data },
        Ok(Reservation::TimedOut) => WireResponse::TimedOut,
        Err(e) => render_err(e),
    }
}

fn render_peeked(
    res: crate::error::Result<Option<(u64, bytes::Bytes)>>,
) -> WireResponse {
    match res {
        Ok(Some((id, data))) => WireResponse::Found { id, data },
        Ok(None) | Err(_) => WireResponse::NotFound,
    }
}

/// The protocol has no ownership-violation reply, so NotOwner renders as
/// NOT_FOUND just like an unknown id.
fn render_err(e: BrokerError) -> WireResponse {
    match e {
        BrokerError::NotFound | BrokerError::NotOwner => WireResponse::NotFound,
        BrokerError::InvalidArgument(_) => WireResponse::BadFormat,
        e => {
            error!(error = %e, "command failed");
            WireResponse::InternalError
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    use crate::config::Config;

    /// Spawns a broker-backed connection handler over an in-memory
    /// stream, returning the client half.
    fn start(
        broker: Arc<Broker>,
    ) -> (DuplexStream, CancellationToken, JoinHandle<()>) {
        let (client, mut server) = duplex(4096);
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                handle_conn(&broker, cancel, &mut server).await.unwrap();
            })
        };
        (client, cancel, handle)
    }

    async fn send(client: &mut DuplexStream, data: &[u8]) {
        client.write_all(data).await.unwrap();
    }

    /// Reads until the accumulated output ends with `want`.
    async fn expect(client: &mut DuplexStream, want: &[u8]) {
        let mut got = Vec::new();
        let mut buf = [0u8; 1024];
        while !got.ends_with(want) {
            let n = client.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "stream ended; got {:?}", got);
            got.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn put_reserve_delete_round_trip() {
        let broker = Arc::new(Broker::open(Config::default()).unwrap());
        let (mut c, _cancel, _h) = start(broker);

        send(&mut c, b"put 10 0 30 5\r\nhello\r\n").await;
        expect(&mut c, b"INSERTED 1\r\n").await;

        send(&mut c, b"reserve\r\n").await;
        expect(&mut c, b"RESERVED 1 5\r\nhello\r\n").await;

        send(&mut c, b"delete 1\r\n").await;
        expect(&mut c, b"DELETED\r\n").await;
    }

    #[tokio::test]
    async fn put_without_crlf_is_rejected_in_sync() {
        let broker = Arc::new(Broker::open(Config::default()).unwrap());
        let (mut c, _cancel, _h) = start(broker);

        send(&mut c, b"put 1 0 30 3\r\nabcXXlist-tubes\r\n").await;
        // The bad terminator is consumed with the body, so the next
        // command still parses.
        expect(&mut c, b"EXPECTED_CRLF\r\n").await;
        expect(&mut c, b"OK 10\r\n- default\n\r\n").await;
    }

    #[tokio::test]
    async fn oversized_put_is_job_too_big() {
        let broker = Arc::new(
            Broker::open(Config { max_job_size: 4, ..Config::default() })
                .unwrap(),
        );
        let (mut c, _cancel, _h) = start(broker);

        send(&mut c, b"put 1 0 30 5\r\nhello\r\n").await;
        expect(&mut c, b"JOB_TOO_BIG\r\n").await;
    }

    #[tokio::test]
    async fn ownership_violations_read_as_not_found() {
        let broker = Arc::new(Broker::open(Config::default()).unwrap());
        let (mut c1, _cancel1, _h1) = start(broker.clone());
        let (mut c2, _cancel2, _h2) = start(broker);

        send(&mut c1, b"put 1 0 30 1\r\nx\r\n").await;
        expect(&mut c1, b"INSERTED 1\r\n").await;
        send(&mut c1, b"reserve\r\n").await;
        expect(&mut c1, b"RESERVED 1 1\r\nx\r\n").await;

        // A different connection can't delete or release the held job.
        send(&mut c2, b"delete 1\r\n").await;
        expect(&mut c2, b"NOT_FOUND\r\n").await;
        send(&mut c2, b"release 1 0 0\r\n").await;
        expect(&mut c2, b"NOT_FOUND\r\n").await;
    }

    #[tokio::test]
    async fn dropped_connection_releases_reservations() {
        let broker = Arc::new(Broker::open(Config::default()).unwrap());

        let (mut c1, _cancel1, h1) = start(broker.clone());
        send(&mut c1, b"put 1 0 30 1\r\nx\r\n").await;
        expect(&mut c1, b"INSERTED 1\r\n").await;
        send(&mut c1, b"reserve\r\n").await;
        expect(&mut c1, b"RESERVED 1 1\r\nx\r\n").await;

        drop(c1);
        h1.await.unwrap();

        // The job is ready again for the next consumer.
        let (mut c2, _cancel2, _h2) = start(broker);
        send(&mut c2, b"reserve-with-timeout 0\r\n").await;
        expect(&mut c2, b"RESERVED 1 1\r\nx\r\n").await;
    }

    #[tokio::test]
    async fn disconnect_during_blocked_reserve_frees_the_session() {
        let broker = Arc::new(Broker::open(Config::default()).unwrap());

        let (mut c1, _cancel1, h1) = start(broker.clone());
        send(&mut c1, b"watch other\r\n").await;
        expect(&mut c1, b"WATCHING 2\r\n").await;
        send(&mut c1, b"reserve\r\n").await;
        tokio::task::yield_now().await;

        // The peer goes away while the reserve is still pending. The
        // handler must notice the EOF and tear the session down rather
        // than wait for a job.
        drop(c1);
        h1.await.unwrap();

        // No session left, so every tube reference was dropped.
        assert!(broker.list_tubes().is_empty());

        // A job arriving now goes to a live consumer, not the dead one.
        let (mut c2, _cancel2, _h2) = start(broker);
        send(&mut c2, b"put 0 0 30 1\r\nx\r\n").await;
        expect(&mut c2, b"INSERTED 1\r\n").await;
        send(&mut c2, b"reserve-with-timeout 0\r\n").await;
        expect(&mut c2, b"RESERVED 1 1\r\nx\r\n").await;
    }

    #[test]
    fn broker_failures_map_to_wire_errors() {
        use std::io;

        assert_eq!(render_err(BrokerError::NotFound), WireResponse::NotFound);
        assert_eq!(render_err(BrokerError::NotOwner), WireResponse::NotFound);
        assert_eq!(
            render_err(BrokerError::InvalidArgument("bad")),
            WireResponse::BadFormat
        );
        // Hard failures reply INTERNAL_ERROR instead of dropping the
        // connection, whichever command hit them.
        assert_eq!(
            render_err(BrokerError::Durability {
                action: "appending record",
                source: io::Error::new(io::ErrorKind::Other, "disk gone"),
            }),
            WireResponse::InternalError
        );
    }

    #[tokio::test]
    async fn watch_ignore_and_tube_listing() {
        let broker = Arc::new(Broker::open(Config::default()).unwrap());
        let (mut c, _cancel, _h) = start(broker);

        send(&mut c, b"watch other\r\n").await;
        expect(&mut c, b"WATCHING 2\r\n").await;
        send(&mut c, b"ignore default\r\n").await;
        expect(&mut c, b"WATCHING 1\r\n").await;
        send(&mut c, b"ignore other\r\n").await;
        expect(&mut c, b"NOT_IGNORED\r\n").await;

        send(&mut c, b"use jobs\r\n").await;
        expect(&mut c, b"USING jobs\r\n").await;
        send(&mut c, b"list-tube-used\r\n").await;
        expect(&mut c, b"USING jobs\r\n").await;
    }

    #[tokio::test]
    async fn unknown_and_malformed_commands_keep_the_connection() {
        let broker = Arc::new(Broker::open(Config::default()).unwrap());
        let (mut c, _cancel, _h) = start(broker);

        send(&mut c, b"stats\r\n").await;
        expect(&mut c, b"UNKNOWN_COMMAND\r\n").await;
        send(&mut c, b"put 1 2\r\n").await;
        expect(&mut c, b"BAD_FORMAT\r\n").await;
        send(&mut c, b"list-tube-used\r\n").await;
        expect(&mut c, b"USING default\r\n").await;
    }
}
