//! Protocol layer tests: frame codec, state edges, error kinds, event shapes.

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use fleet_protocol::*;
    use serde_json::json;

    // ─────────────────────────────────────────────────────────────────────
    // Frame codec
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn data_frame_roundtrip() {
        let frame = Frame::data("tasks", Bytes::from_static(b"hello"));
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), frame.encoded_len());

        let (decoded, consumed) = decode(&encoded).unwrap().expect("complete frame");
        assert_eq!(decoded, frame);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn empty_payload_and_channel_are_allowed() {
        let frame = Frame::control(FrameKind::Goodbye);
        let encoded = frame.encode().unwrap();
        let (decoded, _) = decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Goodbye);
        assert!(decoded.channel.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn partial_buffer_returns_none() {
        let encoded = Frame::data("c", vec![7u8; 64]).encode().unwrap();
        assert!(decode(&encoded[..2]).unwrap().is_none());
        assert!(decode(&encoded[..encoded.len() - 1]).unwrap().is_none());
        assert!(decode(&[]).unwrap().is_none());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        Frame::data("a", Bytes::from_static(b"1")).encode_into(&mut buf).unwrap();
        Frame::data("b", Bytes::from_static(b"22")).encode_into(&mut buf).unwrap();

        let (first, used) = decode(&buf).unwrap().unwrap();
        let (second, used2) = decode(&buf[used..]).unwrap().unwrap();
        assert_eq!(first.channel, "a");
        assert_eq!(second.channel, "b");
        assert_eq!(second.payload.as_ref(), b"22");
        assert_eq!(used + used2, buf.len());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(decode(&buf), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn short_header_is_truncated() {
        let buf = 3u32.to_be_bytes();
        assert!(matches!(decode(&buf), Err(FrameError::Truncated(_))));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut encoded = Frame::ping().encode().unwrap().to_vec();
        // kind byte follows the 4-byte length prefix
        encoded[4] = 0x7f;
        assert!(matches!(decode(&encoded), Err(FrameError::UnknownKind(0x7f))));
    }

    #[test]
    fn invalid_utf8_channel_is_rejected() {
        let mut encoded = Frame::data("ab", Bytes::new()).encode().unwrap().to_vec();
        let channel_start = encoded.len() - 2;
        encoded[channel_start] = 0xff;
        encoded[channel_start + 1] = 0xfe;
        assert!(matches!(decode(&encoded), Err(FrameError::InvalidChannel)));
    }

    #[test]
    fn channel_longer_than_u16_cannot_be_encoded() {
        let frame = Frame::data("x".repeat(70_000), Bytes::new());
        assert!(matches!(frame.encode(), Err(FrameError::ChannelTooLong(70_000))));
    }

    #[test]
    fn validate_checks_limits_without_encoding() {
        assert!(Frame::data("ok", "payload").validate().is_ok());
        assert!(matches!(
            Frame::data("x".repeat(70_000), Bytes::new()).validate(),
            Err(FrameError::ChannelTooLong(70_000))
        ));

        let oversized = Frame::data("big", Bytes::from(vec![0u8; MAX_FRAME_SIZE]));
        assert!(matches!(oversized.validate(), Err(FrameError::TooLarge { max: MAX_FRAME_SIZE, .. })));
        assert!(matches!(oversized.encode(), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn pong_echoes_probe_timestamp() {
        let mut ping = Frame::ping();
        ping.sent_at_ms = 1234;
        let pong = Frame::pong(&ping);
        assert_eq!(pong.kind, FrameKind::Pong);
        assert_eq!(pong.sent_at_ms, 1234);
    }

    #[test]
    fn hello_payload_roundtrip() {
        let hello = Hello {
            version: PROTOCOL_VERSION.into(),
            node_id: "node-7".into(),
        };
        let frame = Frame::hello(FrameKind::Hello, &hello).unwrap();
        let parsed = frame.parse_hello().unwrap();
        assert_eq!(parsed, hello);

        let raw: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(raw, json!({"version": "1", "nodeId": "node-7"}));
    }

    #[test]
    fn frame_kind_codes_are_stable() {
        for kind in [
            FrameKind::Hello,
            FrameKind::HelloAck,
            FrameKind::Data,
            FrameKind::Ping,
            FrameKind::Pong,
            FrameKind::Goodbye,
        ] {
            assert_eq!(FrameKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(FrameKind::from_code(0), None);
    }

    #[tokio::test]
    async fn async_read_write_preserves_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        for i in 0..5u8 {
            write_frame(&mut client, &Frame::data("seq", vec![i])).await.unwrap();
        }
        drop(client);

        for i in 0..5u8 {
            let frame = read_frame(&mut server).await.unwrap().expect("frame");
            assert_eq!(frame.payload.as_ref(), &[i]);
        }
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection state edges
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn permitted_edges() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Failed));
        for state in [Disconnected, Connecting, Connected, Reconnecting, Failed] {
            assert!(state.can_transition_to(Closed), "{state} -> CLOSED");
        }
    }

    #[test]
    fn forbidden_edges() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Reconnecting));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(Closed.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn state_and_mode_serialize_to_stable_names() {
        assert_eq!(serde_json::to_value(ConnectionState::Reconnecting).unwrap(), json!("RECONNECTING"));
        assert_eq!(serde_json::to_value(TransportMode::TcpFallback).unwrap(), json!("TCP_FALLBACK"));
        assert_eq!(serde_json::to_value(TransportMode::Quic).unwrap(), json!("QUIC"));
        assert_eq!(TransportMode::Uninitialized.to_string(), "UNINITIALIZED");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Error kinds and events
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn error_kind_names() {
        assert_eq!(ErrorKind::NotConnected.as_str(), "not-connected");
        assert_eq!(serde_json::to_value(ErrorKind::RetriesExhausted).unwrap(), json!("retries-exhausted"));
        assert_eq!(ErrorKind::CertificateLoad.to_string(), "certificate-load");
        assert!(ErrorKind::ConnectionLost.is_connection_wide());
        assert!(!ErrorKind::NotConnected.is_connection_wide());
        assert_ne!(ErrorKind::Handshake.code(), ErrorKind::HandshakeTimeout.code());
    }

    #[test]
    fn lifecycle_event_json_shape() {
        let event = LifecycleEvent::StateChange { state: ConnectionState::Connected };
        assert_eq!(event.name(), Events::STATE_CHANGE);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "stateChange", "state": "CONNECTED"})
        );

        let event = LifecycleEvent::Error {
            kind: ErrorKind::ConnectionLost,
            details: "reset".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "error", "kind": "connection-lost", "details": "reset"})
        );
        assert_eq!(LifecycleEvent::Reconnected.name(), Events::RECONNECTED);
    }

    #[test]
    fn metrics_snapshot_uses_camel_case() {
        let snapshot = MetricsSnapshot {
            mode: TransportMode::Quic,
            state: ConnectionState::Connected,
            average_latency_ms: 1.5,
            messages_sent: 2,
            messages_received: 3,
            bytes_transferred: 40,
            active_streams: 1,
            failed_attempts: 0,
            connection_uptime_ms: 10,
            reconnections: 0,
            zero_rtt_rejections: 0,
            last_error: None,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["averageLatencyMs"], json!(1.5));
        assert_eq!(value["messagesSent"], json!(2));
        assert_eq!(value["connectionUptimeMs"], json!(10));
        assert!(value.get("lastError").is_none());
    }
}
