// JDWP event handling
//
// The debuggee pushes Event.Composite packets; a dev-mode attach only cares
// about VM lifecycle, so everything else is surfaced as `Other`.

use crate::commands::event_kinds;
use crate::protocol::JdwpResult;
use crate::reader::{read_i32, read_u64, read_u8};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub type ThreadId = u64;

/// Composite event packet (can contain multiple events)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: u8,
    pub request_id: i32,
    pub details: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VMStart { thread: ThreadId },
    VMDeath,
    ThreadStart { thread: ThreadId },
    ThreadDeath { thread: ThreadId },
    Other { kind: u8 },
}

/// What the event loop hands to its consumer.
#[derive(Debug, Clone)]
pub enum DebuggeeEvent {
    Events(EventSet),
    /// The socket closed or failed; no further events will arrive.
    Disconnected,
}

impl EventSet {
    pub fn has_vm_death(&self) -> bool {
        self.events.iter().any(|e| e.details == EventKind::VMDeath)
    }
}

/// Parse the payload of an Event.Composite packet (header already stripped)
pub fn parse_event_packet(data: &[u8]) -> JdwpResult<EventSet> {
    let mut buf = data;

    let suspend_policy = read_u8(&mut buf)?;
    let event_count = read_i32(&mut buf)?.max(0);

    let mut events = Vec::with_capacity(event_count as usize);

    for _ in 0..event_count {
        let kind = read_u8(&mut buf)?;
        let request_id = read_i32(&mut buf)?;

        let details = match kind {
            event_kinds::VM_START => EventKind::VMStart {
                thread: read_u64(&mut buf)?,
            },
            event_kinds::VM_DEATH => EventKind::VMDeath,
            event_kinds::THREAD_START => EventKind::ThreadStart {
                thread: read_u64(&mut buf)?,
            },
            event_kinds::THREAD_DEATH => EventKind::ThreadDeath {
                thread: read_u64(&mut buf)?,
            },
            _ => {
                // Payload layout depends on the kind; the rest of the set
                // can't be located without decoding it.
                debug!("Skipping remainder of event set at kind {}", kind);
                events.push(Event {
                    kind,
                    request_id,
                    details: EventKind::Other { kind },
                });
                break;
            }
        };

        events.push(Event {
            kind,
            request_id,
            details,
        });
    }

    Ok(EventSet {
        suspend_policy,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_start_then_death() {
        let mut raw = vec![2u8, 0, 0, 0, 2];
        raw.push(event_kinds::VM_START);
        raw.extend_from_slice(&0i32.to_be_bytes());
        raw.extend_from_slice(&0x42u64.to_be_bytes());
        raw.push(event_kinds::VM_DEATH);
        raw.extend_from_slice(&0i32.to_be_bytes());

        let set = parse_event_packet(&raw).unwrap();
        assert_eq!(set.suspend_policy, 2);
        assert_eq!(set.events.len(), 2);
        assert_eq!(set.events[0].details, EventKind::VMStart { thread: 0x42 });
        assert!(set.has_vm_death());
    }

    #[test]
    fn stops_at_unknown_kind() {
        let mut raw = vec![0u8, 0, 0, 0, 2];
        raw.push(2); // breakpoint
        raw.extend_from_slice(&5i32.to_be_bytes());
        raw.extend_from_slice(&[0xEE; 16]);

        let set = parse_event_packet(&raw).unwrap();
        assert_eq!(set.events.len(), 1);
        assert_eq!(set.events[0].details, EventKind::Other { kind: 2 });
        assert!(!set.has_vm_death());
    }
}
