use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, warn};

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::request::{parse_request, Command};

const LISTEN_BUFFER: usize = 256;

/// One JSON line sent back to the client, tagged by `result`.
#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reply {
    Slots { slots: Vec<SlotAvailability> },
    Dates { dates: Vec<NaiveDate> },
    Booked { booking: Booking },
    Waitlisted { ticket: WaitlistTicket },
    Full { slot: SlotKey },
    Rescheduled { booking: Booking, promoted: Vec<Booking> },
    Cancelled { booking: Booking, promoted: Vec<Booking> },
    Booking { booking: Booking },
    Bookings { bookings: Vec<Booking> },
    Ticket { ticket: WaitlistTicket },
    Withdrawn { removed: bool },
    Promoted { bookings: Vec<Booking> },
    Admin { view: AdminView },
    Slot { slot: Slot },
    Schedule { created: Vec<SlotKey> },
    Capacity { slot: Slot, promoted: Vec<Booking> },
    Listening { advisor_id: String },
    Change { record: ChangeRecord },
    Error { kind: &'static str, message: String },
}

impl Reply {
    fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Reply::Error {
            kind: kind.as_str(),
            message: message.into(),
        }
    }
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        Reply::error(e.kind(), e.to_string())
    }
}

fn encode(reply: &Reply) -> String {
    serde_json::to_string(reply).unwrap_or_else(|e| {
        error!("failed to encode reply: {e}");
        r#"{"result":"error","kind":"internal","message":"reply encoding failed"}"#.to_string()
    })
}

/// Per-connection state: the advisors this client listens to and the channel
/// their change records are funnelled through.
struct Session {
    engine: Arc<Engine>,
    changes_tx: mpsc::Sender<ChangeRecord>,
    listeners: Vec<(String, JoinHandle<()>)>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, handle) in &self.listeners {
            handle.abort();
        }
    }
}

impl Session {
    async fn handle_line(&mut self, line: &str) -> Reply {
        let cmd = match parse_request(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                return Reply::error(ErrorKind::Validation, e.to_string());
            }
        };
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let reply = match self.execute(cmd).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(command = label, "request failed: {e}");
                Reply::from(e)
            }
        };
        let status = if matches!(reply, Reply::Error { .. }) { "error" } else { "ok" };
        metrics::counter!(observability::REQUESTS_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        reply
    }

    async fn execute(&mut self, cmd: Command) -> Result<Reply, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::CheckAvailability { range, advisor_id } => Ok(Reply::Slots {
                slots: engine.check_availability(&range, advisor_id.as_deref())?,
            }),
            Command::SlotOverview { range, advisor_id } => Ok(Reply::Slots {
                slots: engine.slot_overview(&range, advisor_id.as_deref())?,
            }),
            Command::AvailableDates { advisor_id } => Ok(Reply::Dates {
                dates: engine.available_dates(advisor_id.as_deref()),
            }),
            Command::Book(req) => Ok(match engine.book(req).await? {
                BookOutcome::Confirmed(booking) => Reply::Booked { booking },
                BookOutcome::Waitlisted(ticket) => Reply::Waitlisted { ticket },
                BookOutcome::Full(slot) => Reply::Full { slot },
            }),
            Command::Reschedule { booking_id, slot } => {
                let out = engine.reschedule(booking_id, &slot).await?;
                Ok(Reply::Rescheduled {
                    booking: out.booking,
                    promoted: out.promoted,
                })
            }
            Command::Cancel { booking_id } => {
                let out = engine.cancel(booking_id).await?;
                Ok(Reply::Cancelled {
                    booking: out.cancelled,
                    promoted: out.promoted,
                })
            }
            Command::Amend {
                booking_id,
                contact,
                topic,
            } => Ok(Reply::Booking {
                booking: engine.amend(booking_id, contact, topic).await?,
            }),
            Command::Lookup(criteria) => Ok(Reply::Bookings {
                bookings: engine.lookup(&criteria),
            }),
            Command::LookupCode { code } => Ok(match engine.lookup_code(code)? {
                CodeLookup::Booking(booking) => Reply::Booking { booking },
                CodeLookup::Waitlist(ticket) => Reply::Ticket { ticket },
            }),
            Command::JoinWaitlist {
                user_id,
                contact,
                topic,
                slot,
            } => Ok(Reply::Ticket {
                ticket: engine
                    .join_waitlist(&user_id, &contact, topic.as_deref(), &slot)
                    .await?,
            }),
            Command::Withdraw { user_id, slot } => Ok(Reply::Withdrawn {
                removed: engine.withdraw(&user_id, &slot).await?,
            }),
            Command::WithdrawEntry { entry_id } => {
                engine.withdraw_entry(entry_id).await?;
                Ok(Reply::Withdrawn { removed: true })
            }
            Command::Promote { slot } => Ok(Reply::Promoted {
                bookings: engine.promote(&slot).await?,
            }),
            Command::AdminView => Ok(Reply::Admin {
                view: engine.admin_view(),
            }),
            Command::OpenSlot { slot, capacity } => Ok(Reply::Slot {
                slot: engine.open_slot(&slot, capacity).await?,
            }),
            Command::OpenSchedule(schedule) => Ok(Reply::Schedule {
                created: engine.open_schedule(&schedule).await?,
            }),
            Command::SetCapacity { slot, capacity } => {
                let out = engine.set_capacity(&slot, capacity).await?;
                Ok(Reply::Capacity {
                    slot: out.slot,
                    promoted: out.promoted,
                })
            }
            Command::Listen { advisor_id } => {
                self.listen(&advisor_id);
                Ok(Reply::Listening { advisor_id })
            }
        }
    }

    /// Forward the advisor's change records into this connection. Subscribing
    /// happens before the reply goes out, so nothing committed after it is missed.
    fn listen(&mut self, advisor_id: &str) {
        if self.listeners.iter().any(|(a, _)| a == advisor_id) {
            return;
        }
        let mut rx = self.engine.notify().subscribe(advisor_id);
        let tx = self.changes_tx.clone();
        let advisor = advisor_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(advisor_id = %advisor, skipped, "listener lagged, changes dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.push((advisor_id.to_string(), handle));
    }
}

/// Serve one client: read JSON request lines, write one reply line per request,
/// interleaved with change lines for any advisors the client listens to.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (changes_tx, mut changes_rx) = mpsc::channel(LISTEN_BUFFER);
    let mut session = Session {
        engine,
        changes_tx,
        listeners: Vec::new(),
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => break,
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => session.handle_line(&line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        Reply::error(ErrorKind::Validation, format!("request line exceeds {MAX_LINE_LEN} bytes"))
                    }
                    Some(Err(e)) => return Err(e),
                };
                framed.send(encode(&reply)).await?;
            }
            Some(record) = changes_rx.recv() => {
                framed.send(encode(&Reply::Change { record })).await?;
            }
        }
    }
    Ok(())
}
