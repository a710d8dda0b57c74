use std::fmt;

use shared::domain::ParticipantSummary;

use crate::MessageRecord;

/// Display status of an outbound message, derived fresh on every render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure function of (pending?, delivered-to, read-by, recipient roster).
///
/// Recipients are the current participants other than the sender, so members
/// removed from a group are no longer waited on. A read receipt counts as
/// evidence of delivery even when no delivery receipt was recorded for that
/// recipient.
pub fn message_status(record: &MessageRecord, participants: &[ParticipantSummary]) -> DeliveryStatus {
    if record.is_pending() {
        return DeliveryStatus::Sending;
    }

    let recipients: Vec<_> = participants
        .iter()
        .map(|p| p.user_id)
        .filter(|id| *id != record.sender_id)
        .collect();
    if recipients.is_empty() {
        return DeliveryStatus::Sent;
    }

    if recipients.iter().all(|r| record.read_by.contains(r)) {
        return DeliveryStatus::Read;
    }
    if recipients
        .iter()
        .all(|r| record.delivered_to.contains(r) || record.read_by.contains(r))
    {
        return DeliveryStatus::Delivered;
    }
    DeliveryStatus::Sent
}
