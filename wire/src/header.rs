use bilge::prelude::*;
use macros::Cast;
use utils::endian::{u16be, BigEndian};

/// A four bit field that specifies kind of query in a message. Set by the originator
/// of a query and copied into the response.
#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
	/// a standard query
	Query = 0,
	/// an inverse query
	IQuery = 1,
	/// a server status request
	Status = 2,
	#[fallback]
	Reserved,
}

/// Response code, valid only in responses.
#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rcode {
	NoError = 0,
	FormErr = 1,
	ServFail = 2,
	NxDomain = 3,
	NotImp = 4,
	Refused = 5,
	#[fallback]
	Reserved,
}

/// The 16 bitfields following the message id. Declared from the lowest bit (`rcode`)
/// to the highest (`qr`), matching the big-endian wire layout once wrapped in
/// [`BigEndian`].
#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
pub struct Flags {
	pub rcode: Rcode,
	pub cd: bool,
	pub ad: bool,
	pub z: bool,
	pub ra: bool,
	pub rd: bool,
	pub tc: bool,
	pub aa: bool,
	pub opcode: Opcode,
	pub qr: bool,
}

/// The 12-byte header present in every DNS message.
#[derive(Cast)]
#[repr(C)]
pub struct Header {
	/// Copied verbatim from request to response so callers can match replies to queries.
	pub id: u16be,
	pub flags: BigEndian<Flags>,
	pub qdcount: u16be,
	pub ancount: u16be,
	pub nscount: u16be,
	pub arcount: u16be,
}

impl Header {
	pub const SIZE: usize = core::mem::size_of::<Header>();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_is_twelve_bytes() {
		assert_eq!(Header::SIZE, 12);
	}

	#[test]
	fn flags_round_trip_through_big_endian_wrapper() {
		let flags = Flags::new(Rcode::NoError, false, false, false, false, true, false, true, Opcode::Query, true);

		let be: BigEndian<Flags> = flags.into();
		let back = be.get();

		assert!(back.qr());
		assert!(back.aa());
		assert!(back.rd());
		assert!(!back.tc());
		assert_eq!(back.opcode(), Opcode::Query);
		assert_eq!(back.rcode(), Rcode::NoError);
	}
}
