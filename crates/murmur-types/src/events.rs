use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frame sent FROM a client TO the realtime gateway.
///
/// Older clients send only `from` and `message`; newer ones also send their
/// local `date`. The server always restamps the message on receipt, so the
/// client date is accepted but never trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFrame {
    pub from: String,
    pub message: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl InboundFrame {
    /// Turn the frame into an archived message stamped at `now`.
    pub fn stamp(self, now: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            from: self.from,
            message: self.message,
            date: now,
        }
    }
}

/// A chat message as archived and as broadcast to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: String,
    pub message: String,
    pub date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bare_frame_decodes_without_date() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"from":"alice","message":"hi"}"#).unwrap();
        assert_eq!(frame.from, "alice");
        assert!(frame.date.is_none());
    }

    #[test]
    fn stamp_overrides_client_date() {
        let client_date = Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let frame = InboundFrame {
            from: "bob".into(),
            message: "yo".into(),
            date: Some(client_date),
        };

        let msg = frame.stamp(now);
        assert_eq!(msg.date, now);
        assert_eq!(msg.message, "yo");
    }

    #[test]
    fn frame_missing_message_is_rejected() {
        assert!(serde_json::from_str::<InboundFrame>(r#"{"from":"alice"}"#).is_err());
    }
}
