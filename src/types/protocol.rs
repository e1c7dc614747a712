use bytes::Bytes;

use super::serialisable::WireSerialise;

/// A command sent by the client. One variant per wire verb this broker
/// serves; the stats and pause-tube families are not supported and parse
/// as unknown commands.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WireCommand {
    /// Places a job onto the currently `use`d tube; `n_bytes` of payload
    /// follow on the wire.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// Awaits a job from the watched tubes, blocking until one appears.
    ///
    /// On the wire: `reserve`
    Reserve,
    /// As `reserve`, but replies `TIMED_OUT` after `timeout` seconds with
    /// no job.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// Returns a job reserved by this client to the ready (or delayed)
    /// state with a new priority.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// Deletes a job reserved by this client, or one in the ready,
    /// delayed, or buried states.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Buries a job reserved by this client.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// Refreshes the TTR deadline of a job reserved by this client.
    ///
    /// On the wire: `touch <id>`
    Touch { id: u64 },
    /// Adds a tube to this client's watchlist.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: String },
    /// Removes a tube from the watchlist; refused for the last entry.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: String },
    /// Selects the tube future `put`s target.
    ///
    /// On the wire: `use <tube>`
    Use { tube: String },
    /// Returns the data for the job with this id regardless of state.
    ///
    /// On the wire: `peek <id>`
    Peek { id: u64 },
    /// Returns the next ready job on the currently-used tube.
    ///
    /// On the wire: `peek-ready`
    PeekReady,
    /// Returns the delayed job closest to becoming ready on the
    /// currently-used tube.
    ///
    /// On the wire: `peek-delayed`
    PeekDelayed,
    /// Returns the oldest buried job on the currently-used tube.
    ///
    /// On the wire: `peek-buried`
    PeekBuried,
    /// Promotes up to `bound` buried jobs on the currently-used tube to
    /// ready; if none are buried, promotes delayed jobs instead.
    ///
    /// On the wire: `kick <bound>`
    Kick { bound: u64 },
    /// Promotes a single buried or delayed job by id.
    ///
    /// On the wire: `kick-job <id>`
    KickJob { id: u64 },
    /// Lists the tubes that currently exist.
    ///
    /// On the wire: `list-tubes`
    ListTubes,
    /// Reports the tube this client is using.
    ///
    /// On the wire: `list-tube-used`
    ListTubeUsed,
    /// Lists the tubes this client is watching.
    ///
    /// On the wire: `list-tubes-watched`
    ListTubesWatched,
    /// Asks the server to close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

/// All responses this broker sends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WireResponse {
    /// The request was malformed: bad numbers, bad tube name, trailing
    /// garbage.
    ///
    /// On the wire: `BAD_FORMAT`
    BadFormat,
    /// The verb is not one this broker serves.
    ///
    /// On the wire: `UNKNOWN_COMMAND`
    UnknownCommand,
    /// A server bug or an unrecoverable internal failure.
    ///
    /// On the wire: `INTERNAL_ERROR`
    InternalError,
    /// A `put` payload was not terminated by CRLF.
    ///
    /// On the wire: `EXPECTED_CRLF`
    ExpectedCrlf,
    /// A `put` payload exceeded the configured maximum size.
    ///
    /// On the wire: `JOB_TOO_BIG`
    JobTooBig,
    /// A `put` succeeded.
    ///
    /// On the wire: `INSERTED <id>`
    Inserted { id: u64 },
    /// A reservation was granted.
    ///
    /// On the wire: `RESERVED <id> <bytes>` plus data
    Reserved { id: u64, data: Bytes },
    /// A `reserve-with-timeout` elapsed with no job available.
    ///
    /// On the wire: `TIMED_OUT`
    TimedOut,
    /// The job is unknown, or doesn't satisfy a precondition of the
    /// command (including reservation ownership).
    ///
    /// On the wire: `NOT_FOUND`
    NotFound,
    /// On the wire: `DELETED`
    Deleted,
    /// On the wire: `RELEASED`
    Released,
    /// On the wire: `BURIED`
    Buried,
    /// On the wire: `TOUCHED`
    Touched,
    /// A `kick-job` succeeded.
    ///
    /// On the wire: `KICKED`
    Kicked,
    /// A `kick` succeeded, with the number of jobs kicked.
    ///
    /// On the wire: `KICKED <count>`
    KickedCount { count: u64 },
    /// Success for `watch`/`ignore`: the new watch count.
    ///
    /// On the wire: `WATCHING <count>`
    Watching { count: usize },
    /// An `ignore` would have emptied the watchlist.
    ///
    /// On the wire: `NOT_IGNORED`
    NotIgnored,
    /// Success for `use` and `list-tube-used`.
    ///
    /// On the wire: `USING <tube>`
    Using { tube: String },
    /// Success for the `peek` family.
    ///
    /// On the wire: `FOUND <id> <bytes>` plus data
    Found { id: u64, data: Bytes },
    /// Success for the `list-tubes` family: a YAML list body.
    ///
    /// On the wire: `OK <bytes>` plus data
    OkTubeList { tubes: Vec<String> },
}

impl WireSerialise for WireResponse {
    fn serialise_wire(&self) -> Vec<u8> {
        use WireResponse::*;

        match self {
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            ExpectedCrlf => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            Reserved { id, data } => with_body(&format!("RESERVED {id} {}", data.len()), data),
            TimedOut => b"TIMED_OUT\r\n".to_vec(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            Deleted => b"DELETED\r\n".to_vec(),
            Released => b"RELEASED\r\n".to_vec(),
            Buried => b"BURIED\r\n".to_vec(),
            Touched => b"TOUCHED\r\n".to_vec(),
            Kicked => b"KICKED\r\n".to_vec(),
            KickedCount { count } => format!("KICKED {count}\r\n").into(),
            Watching { count } => format!("WATCHING {count}\r\n").into(),
            NotIgnored => b"NOT_IGNORED\r\n".to_vec(),
            Using { tube } => format!("USING {tube}\r\n").into(),
            Found { id, data } => with_body(&format!("FOUND {id} {}", data.len()), data),
            OkTubeList { tubes } => {
                // serde_yaml can only fail on unserialisable types; a list
                // of strings is not one.
                let body = serde_yaml::to_string(tubes).unwrap_or_default();
                with_body(&format!("OK {}", body.len()), body.as_bytes())
            },
        }
    }
}

fn with_body(head: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len() + body.len() + 4);
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_with_bodies_frame_correctly() {
        let r = WireResponse::Reserved { id: 42, data: Bytes::from_static(b"abc") };
        assert_eq!(r.serialise_wire(), b"RESERVED 42 3\r\nabc\r\n");

        let r = WireResponse::Found { id: 7, data: Bytes::new() };
        assert_eq!(r.serialise_wire(), b"FOUND 7 0\r\n\r\n");
    }

    #[test]
    fn tube_list_is_yaml() {
        let r = WireResponse::OkTubeList {
            tubes: vec!["default".to_string(), "jobs".to_string()],
        };
        let out = r.serialise_wire();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("OK "));
        assert!(text.contains("- default"));
        assert!(text.contains("- jobs"));
    }
}
