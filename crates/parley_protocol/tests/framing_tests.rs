use bytes::BytesMut;
use parley_domain::{GroupId, Message, Room, UserId};
use parley_protocol::{
	Address, ClientEvent, ClientFrame, DEFAULT_MAX_FRAME_SIZE, ServerEvent, ServerFrame, decode_frame, encode_frame,
	encode_frame_default, encode_frame_into, frame_len_from_payload_len, try_decode_frame_from_buffer,
};
use proptest::prelude::*;

#[test]
fn client_frame_roundtrips_through_wire_format() {
	let frame = ClientFrame::new(ClientEvent::MessageSend {
		to: Address::group(GroupId::new_v4()),
		content: "release at noon".to_string(),
		attachment: Some("https://cdn.example/notes.pdf".to_string()),
		parent: None,
	});

	let wire = encode_frame_default(&frame).expect("encode");
	let (decoded, consumed) = decode_frame::<ClientFrame>(&wire, DEFAULT_MAX_FRAME_SIZE).expect("decode");

	assert_eq!(consumed, wire.len());
	assert_eq!(decoded, frame);
}

#[test]
fn server_frames_decode_in_order_from_shared_buffer() {
	let sender = UserId::new_v4();
	let msg = Message::new(sender, Room::User(UserId::new_v4()), "hi", 1_700_000_000_000);

	let first = ServerFrame::new(ServerEvent::MessageReceive(msg.clone()));
	let second = ServerFrame::new(ServerEvent::UserOnline { user_id: sender });

	let mut buf = BytesMut::new();
	encode_frame_into(&mut buf, &first, DEFAULT_MAX_FRAME_SIZE).expect("encode first");
	encode_frame_into(&mut buf, &second, DEFAULT_MAX_FRAME_SIZE).expect("encode second");

	let d1: ServerFrame = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("first frame");
	let d2: ServerFrame = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("second frame");

	assert_eq!(d1, first);
	assert_eq!(d2, second);
	assert!(buf.is_empty());
}

#[test]
fn frame_len_helper_matches_encoded_length() {
	let frame = ServerFrame::new(ServerEvent::Typing { from: UserId::new_v4() });

	let payload_len = serde_json::to_vec(&frame).expect("payload").len();
	let wire = encode_frame_default(&frame).expect("encode");

	assert_eq!(frame_len_from_payload_len(payload_len), wire.len());
}

proptest! {
	#[test]
	fn arbitrary_content_survives_framing(content in ".{0,512}", split in 0usize..64) {
		let frame = ClientFrame::new(ClientEvent::MessageSend {
			to: Address::user(UserId::new_v4()),
			content,
			attachment: None,
			parent: None,
		});

		let wire = encode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("encode");

		// Feed the wire bytes in two chunks at an arbitrary boundary.
		let split = split.min(wire.len());
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&wire[..split]);
		let early: Option<ClientFrame> =
			try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("partial ok");
		if split < wire.len() {
			prop_assert!(early.is_none());
			buf.extend_from_slice(&wire[split..]);
		}

		let decoded: ClientFrame = match early {
			Some(frame) => frame,
			None => try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
				.expect("ok")
				.expect("complete frame"),
		};
		prop_assert_eq!(decoded, frame);
		prop_assert!(buf.is_empty());
	}

	#[test]
	fn truncated_frames_never_consume_bytes(cut in 0usize..4) {
		let frame = ClientFrame::new(ClientEvent::CallEnd { recipient: UserId::new_v4() });
		let wire = encode_frame_default(&frame).expect("encode");

		let mut buf = BytesMut::new();
		buf.extend_from_slice(&wire[..wire.len() - 1 - cut]);
		let before = buf.len();

		let out: Option<ClientFrame> = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok");
		prop_assert!(out.is_none());
		prop_assert_eq!(buf.len(), before);
	}
}
