//! Wire and on-disk encoding (C1 — spec §4.1).

pub mod hashfile;
pub mod packet;
pub mod primitive;

pub use hashfile::{HashFile, Record, SlotStatus};
pub use packet::{decode_header, encode_oneway, encode_reply, encode_request, finish, Direction, Header, MAX_PACKET_SIZE};
pub use primitive::{Decoder, Encoder};
