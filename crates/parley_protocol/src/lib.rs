#![forbid(unsafe_code)]

pub mod events;
pub mod framing;

pub use events::{Address, ClientEvent, ClientFrame, ErrorCode, PROTOCOL_VERSION, ServerEvent, ServerFrame};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};
