//! Sharded writer tasks.
//!
//! Sessions with queued output are ticketed into one of `K` writer shards, chosen by
//! session id. A session therefore always drains on the same task, which keeps its
//! packets in queue order while different sessions write in parallel.
//!
//! A writer pass never waits on a peer. When a TCP socket stops taking bytes the
//! session keeps its ticket claim and a separate waiter re-tickets it once the socket
//! drains, or closes it after `write_timeout`. WebSocket batches are bounded by the
//! same timeout.

use crate::engine::EngineCore;
use crate::session::channel::{StreamChannel, WriteProgress};
use crate::session::Session;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Packets written per queue before yielding to other sessions in the shard.
pub const WRITE_BATCH: usize = 64;

/// How a writer pass over one session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Drained,
    Blocked,
    Closed,
}

pub(crate) async fn run_writer(core: Arc<EngineCore>, shard: usize) {
    let Some(tickets) = core.writers.queue_by_index(shard) else {
        return;
    };
    debug!(shard, "Writer started");

    loop {
        let id = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            id = tickets.next() => id,
        };
        let Some(session) = core.sessions.get(id) else {
            continue;
        };

        let pass = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            pass = write_session(&core, &session) => pass,
        };

        match pass {
            Pass::Blocked => await_writable(&core, session),
            Pass::Closed => {}
            Pass::Drained => {
                session.clear_scheduled();
                if session.is_activated() && session.has_pending_output() && session.try_schedule() {
                    tickets.push(id);
                }
            }
        }
    }

    debug!(shard, "Writer stopped");
}

async fn write_session(core: &EngineCore, session: &Arc<Session>) -> Pass {
    let mut pass = Pass::Drained;

    if let Some(stream) = session.stream() {
        let limit = core.config.transport.write_timeout;
        pass = match tokio::time::timeout(limit, write_stream(core, session, stream)).await {
            Ok(pass) => pass,
            Err(_) => {
                warn!(session = session.id(), ?limit, "Stream write timed out, closing session");
                core.close_session(session);
                Pass::Closed
            }
        };
        if pass == Pass::Closed {
            return pass;
        }
    }

    if let Some(channel) = session.datagram() {
        for packet in channel.queue().take_batch(WRITE_BATCH) {
            match channel.send(packet.data()).await {
                Ok(Some(written)) => {
                    record_bytes(core, session, written);
                    core.statistics.update_written_packets(1);
                }
                Ok(None) => {
                    trace!(session = session.id(), "Datagram remote not known yet");
                    core.statistics.update_written_dropped_packets(1);
                }
                Err(e) => {
                    debug!(session = session.id(), error = %e, "Datagram send failed");
                    core.statistics.update_written_dropped_packets(1);
                }
            }
        }
    }

    if let Some(channel) = session.kcp() {
        for packet in channel.queue().take_batch(WRITE_BATCH) {
            // KCP output counts bytes itself as segments hit the socket.
            if let Err(e) = channel.send(packet.data()) {
                debug!(session = session.id(), error = %e, "KCP send failed");
                core.statistics.update_written_dropped_packets(1);
            }
        }
    }

    pass
}

/// Write up to one batch from the session's stream queue.
///
/// A fragment left by an earlier pass goes out before any new packet. A packet is
/// counted as written once all of its bytes are with the socket or held behind it.
async fn write_stream(core: &EngineCore, session: &Arc<Session>, stream: &StreamChannel) -> Pass {
    match stream.flush().await {
        Ok(progress) => {
            record_bytes(core, session, progress.written());
            if progress.is_blocked() {
                return Pass::Blocked;
            }
        }
        Err(e) => {
            debug!(session = session.id(), error = %e, "Stream write failed");
            core.close_session(session);
            return Pass::Closed;
        }
    }

    let mut written_any = false;
    for _ in 0..WRITE_BATCH {
        let Some(packet) = session.packet_queue().take() else {
            break;
        };
        match stream.write(packet.data()).await {
            Ok(progress) => {
                record_bytes(core, session, progress.written());
                core.statistics.update_written_packets(1);
                written_any = true;
                if let WriteProgress::Blocked(_) = progress {
                    trace!(session = session.id(), held = stream.unsent_len(), "Stream socket full");
                    return Pass::Blocked;
                }
            }
            Err(e) => {
                debug!(session = session.id(), error = %e, "Stream write failed");
                core.statistics.update_written_dropped_packets(1);
                core.close_session(session);
                return Pass::Closed;
            }
        }
    }

    if written_any {
        match stream.flush().await {
            Ok(progress) => {
                record_bytes(core, session, progress.written());
                if progress.is_blocked() {
                    return Pass::Blocked;
                }
            }
            Err(e) => {
                debug!(session = session.id(), error = %e, "Stream flush failed");
                core.close_session(session);
                return Pass::Closed;
            }
        }
    }
    Pass::Drained
}

/// Park a blocked session until its socket drains, then hand it back to its shard.
///
/// The session stays claimed meanwhile, so new output does not ticket it again.
fn await_writable(core: &Arc<EngineCore>, session: Arc<Session>) {
    let core = core.clone();
    core.tracker.clone().spawn(async move {
        let Some(stream) = session.stream() else {
            return;
        };
        let closed = session.closed();
        let limit = core.config.transport.write_timeout;
        let ready = tokio::select! {
            _ = core.shutdown.cancelled() => return,
            _ = closed.cancelled() => return,
            ready = tokio::time::timeout(limit, stream.writable()) => ready,
        };

        match ready {
            Ok(Ok(())) => {
                let id = session.id();
                core.writers.queue_by_element_id(id as i64).push(id);
            }
            Ok(Err(e)) => {
                debug!(session = session.id(), error = %e, "Stream failed while blocked");
                core.close_session(&session);
            }
            Err(_) => {
                warn!(
                    session = session.id(),
                    ?limit,
                    held = stream.unsent_len(),
                    "Peer stopped reading, closing session"
                );
                core.close_session(&session);
            }
        }
    });
}

fn record_bytes(core: &EngineCore, session: &Session, written: usize) {
    if written == 0 {
        return;
    }
    core.statistics.update_written_bytes(written as u64);
    session.add_written_bytes(written as u64);
}
