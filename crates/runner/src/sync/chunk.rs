//! Frame-size-aware chunking for `sync_sessions_response`.
//!
//! Greedy packing in input order: a chunk closes as soon as adding the
//! next session would exceed the byte budget. A single oversized session
//! still travels alone — better one fat frame than silent loss.

use ar_protocol::envelope::SessionPayload;

fn payload_bytes(session: &SessionPayload) -> usize {
    serde_json::to_string(session).map(|s| s.len()).unwrap_or(0)
}

/// Split sessions into frames each serializing under `max_bytes`
/// (modulo the small envelope overhead).
pub fn chunk_sessions(sessions: Vec<SessionPayload>, max_bytes: usize) -> Vec<Vec<SessionPayload>> {
    let mut chunks: Vec<Vec<SessionPayload>> = Vec::new();
    let mut current: Vec<SessionPayload> = Vec::new();
    let mut current_bytes = 0usize;

    for session in sessions {
        let bytes = payload_bytes(&session);
        if bytes > max_bytes {
            tracing::warn!(
                session_id = %session.session_id,
                bytes,
                max_bytes,
                "single session exceeds the frame budget, sending alone"
            );
        }
        if !current.is_empty() && current_bytes + bytes > max_bytes {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += bytes;
        current.push(session);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_protocol::blocks::{Block, Role, StructuredMessage};
    use ar_protocol::CliKind;
    use chrono::{TimeZone, Utc};

    /// A session whose serialized form is close to `approx_bytes`.
    fn session_of_size(id: usize, approx_bytes: usize) -> SessionPayload {
        let filler = "x".repeat(approx_bytes.saturating_sub(300));
        SessionPayload {
            session_id: format!("sess-{id}"),
            cli_kind: CliKind::Claude,
            project_path: "/home/u/proj".into(),
            updated_at: Utc.timestamp_opt(0, 0).single().unwrap(),
            messages: vec![StructuredMessage {
                id: format!("t{id}:0:0"),
                role: Role::User,
                created_at: Utc.timestamp_opt(0, 0).single().unwrap(),
                turn_id: format!("t{id}"),
                item_id: "0".into(),
                content: vec![Block::Text { text: filler }],
            }],
        }
    }

    #[test]
    fn everything_fits_in_one_frame() {
        let sessions: Vec<_> = (0..5).map(|i| session_of_size(i, 1_000)).collect();
        let chunks = chunk_sessions(sessions, 1024 * 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 5);
    }

    #[test]
    fn frames_respect_the_byte_budget() {
        let max = 64 * 1024;
        let sessions: Vec<_> = (0..40).map(|i| session_of_size(i, 10_000)).collect();
        let chunks = chunk_sessions(sessions, max);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let bytes: usize = chunk.iter().map(payload_bytes).sum();
            assert!(bytes <= max, "chunk of {bytes} bytes exceeds {max}");
        }
        // Nothing lost, order preserved.
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 40);
        assert_eq!(chunks[0][0].session_id, "sess-0");
        let last = chunks.last().unwrap().last().unwrap();
        assert_eq!(last.session_id, "sess-39");
    }

    #[test]
    fn six_megabytes_at_two_megabyte_cap_is_four_frames() {
        // ~6.2 MiB of sessions with the default 2 MiB cap.
        let sessions: Vec<_> = (0..31).map(|i| session_of_size(i, 200 * 1024)).collect();
        let chunks = chunk_sessions(sessions, 2 * 1024 * 1024);
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn oversized_session_travels_alone() {
        let sessions = vec![
            session_of_size(0, 1_000),
            session_of_size(1, 100_000),
            session_of_size(2, 1_000),
        ];
        let chunks = chunk_sessions(sessions, 10_000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1][0].session_id, "sess-1");
    }

    #[test]
    fn empty_input_yields_no_frames() {
        assert!(chunk_sessions(Vec::new(), 1024).is_empty());
    }
}
