//! The per-request Query object: request/response buffers, parsed question
//! fields, and the `end_code` discriminator that decides whether (and what) a
//! response is sent.

use utils::bytes::{as_slice, cast};
use utils::sockaddr::SocketAddr;
use wire::{header, rr, Edns, Header, RrHeader};

/// `end_code` values. `0..=15` and `16` (BADVERS) are "send a response";
/// everything else suppresses the response while still allowing the query to
/// be logged.
pub mod end_code {
	pub const IN_FLIGHT: i32 = -1;
	pub const SHORT_HEADER: i32 = -2;
	pub const TOO_LARGE: i32 = -3;
	pub const TC_SET: i32 = -4;
	pub const WRITE_ERR: i32 = -6;
	pub const WRITE_CLOSED: i32 = -7;
	pub const BADVERS: i32 = 16;

	pub fn sends_response(code: i32) -> bool {
		(0..=16).contains(&code)
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protocol {
	Udp,
	Tcp,
}

/// One resource record destined for a section of the response. `rdata` is
/// already wire-encoded (e.g. 4 raw bytes for an A record) since this crate's
/// resolver only ever produces a fixed set of record shapes.
#[derive(Clone, Debug)]
pub struct Record {
	pub name: String,
	pub ty: u16,
	pub class: u16,
	pub ttl: u32,
	pub rdata: Vec<u8>,
}

pub const MAX_ANSWER: usize = 128;
pub const MAX_AUTHORITY: usize = 16;
pub const MAX_ADDITIONAL: usize = 128;

/// A parsed (or in-flight) DNS query plus the response being assembled for it.
/// Allocated once per UDP vector slot / TCP simultaneous-query slot and reset
/// (not freed) between uses.
pub struct Query {
	pub protocol: Protocol,
	pub client_ip: SocketAddr,
	pub local_ip: SocketAddr,

	pub request: Vec<u8>,

	/// For TCP, includes the 2-byte length prefix at offset 0.
	pub response: Vec<u8>,

	pub id: u16,
	pub rd: bool,
	pub tc_request: bool,
	pub opcode: u8,
	pub q_name: String,
	pub q_type: u16,
	pub q_class: u16,
	pub edns: Edns,

	pub answer: Vec<Record>,
	pub authority: Vec<Record>,
	pub additional: Vec<Record>,

	pub recv_time_ns: u64,
	pub send_time_ns: Option<u64>,

	pub end_code: i32,
}

impl Query {
	pub fn new(protocol: Protocol) -> Self {
		let response_cap = match protocol {
			Protocol::Udp => wire::UDP_MAXMSG,
			Protocol::Tcp => 2 + wire::UDP_MAXMSG,
		};

		Self {
			protocol,
			client_ip: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0),
			local_ip: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0),
			request: Vec::with_capacity(wire::PACKETSZ + 1),
			response: Vec::with_capacity(response_cap),
			id: 0,
			rd: false,
			tc_request: false,
			opcode: 0,
			q_name: String::new(),
			q_type: 0,
			q_class: 0,
			edns: Edns::absent(),
			answer: Vec::new(),
			authority: Vec::new(),
			additional: Vec::new(),
			recv_time_ns: 0,
			send_time_ns: None,
			end_code: end_code::IN_FLIGHT,
		}
	}

	/// Zeroes parsed fields, section counts, end_code, and the request data
	/// while preserving the owning buffers' allocations.
	pub fn reset(&mut self) {
		self.request.clear();
		self.response.clear();
		self.id = 0;
		self.rd = false;
		self.tc_request = false;
		self.opcode = 0;
		self.q_name.clear();
		self.q_type = 0;
		self.q_class = 0;
		self.edns = Edns::absent();
		self.answer.clear();
		self.authority.clear();
		self.additional.clear();
		self.recv_time_ns = 0;
		self.send_time_ns = None;
		self.end_code = end_code::IN_FLIGHT;
	}

	/// Doubles the response buffer's capacity in `UDP_MAXMSG` increments, up to
	/// a ceiling of `MAXMSG`. Only meaningful for TCP responses, which may grow
	/// past a single datagram's worth of records.
	pub fn grow_response(&mut self) {
		let next = (self.response.capacity() * 2).min(wire::MAXMSG);
		if next > self.response.capacity() {
			self.response.reserve(next - self.response.len());
		}
	}

	/// Stage 6: parses `raw` (the framed message, without any TCP length
	/// prefix) and sets `end_code` accordingly. Leaves `end_code ==
	/// IN_FLIGHT` only when parsing succeeded and resolution (Stage 7) is
	/// still pending.
	pub fn parse(&mut self, raw: &[u8]) {
		self.request.clear();
		self.request.extend_from_slice(raw);

		if raw.len() < Header::SIZE {
			self.end_code = end_code::SHORT_HEADER;
			return;
		}

		let hdr: &Header = cast(&raw[..Header::SIZE]);
		let flags = hdr.flags.get();

		self.id = hdr.id.get();
		self.rd = flags.rd();
		self.tc_request = flags.tc();
		self.opcode = flags.opcode() as u8;

		if flags.tc() {
			self.end_code = end_code::TC_SET;
			return;
		}

		if flags.opcode() != header::Opcode::Query {
			self.end_code = wire::header::Rcode::NotImp as i32;
			return;
		}

		if flags.qr() {
			self.end_code = wire::header::Rcode::FormErr as i32;
			return;
		}

		let qdcount = hdr.qdcount.get();
		let ancount = hdr.ancount.get();
		let nscount = hdr.nscount.get();
		let arcount = hdr.arcount.get();

		if qdcount == 0 {
			self.end_code = wire::header::Rcode::FormErr as i32;
			return;
		}

		if qdcount > 1 {
			self.end_code = wire::header::Rcode::NotImp as i32;
			return;
		}

		if ancount != 0 || nscount != 0 {
			self.end_code = wire::header::Rcode::FormErr as i32;
			return;
		}

		let (name, name_len) = match wire::name::decode(raw, Header::SIZE) {
			Ok(v) => v,
			Err(_) => {
				self.end_code = wire::header::Rcode::FormErr as i32;
				return;
			}
		};

		let mut pos = Header::SIZE + name_len;

		let Some(qtype_class) = raw.get(pos..pos + 4) else {
			self.end_code = wire::header::Rcode::FormErr as i32;
			return;
		};

		let q_type = u16::from_be_bytes([qtype_class[0], qtype_class[1]]);
		let q_class = u16::from_be_bytes([qtype_class[2], qtype_class[3]]);
		pos += 4;

		if q_type != wire::TYPE_A || q_class != wire::CLASS_IN {
			self.end_code = wire::header::Rcode::NotImp as i32;
			return;
		}

		self.q_name = name;
		self.q_type = q_type;
		self.q_class = q_class;

		if arcount > 0 {
			if let Some(edns) = scan_for_opt(raw, pos) {
				match edns {
					Ok(edns) => {
						let badvers = !edns.valid;
						self.edns = edns;

						if badvers {
							self.end_code = end_code::BADVERS;
							return;
						}
					}
					Err(_) => {
						self.end_code = wire::header::Rcode::FormErr as i32;
						return;
					}
				}
			}
		}

		self.end_code = end_code::IN_FLIGHT;
	}

	/// Stage 8: packs the response header, question, and sections into
	/// `self.response`. For TCP, the 2-byte length prefix occupies the first
	/// two bytes. On overflow of any section, sets TC and stops packing
	/// further records rather than failing the whole response.
	pub fn pack(&mut self) {
		self.response.clear();

		if self.end_code >= 16 {
			self.edns.extended_rcode = (self.end_code >> 4) as u8;
		}

		let rcode = match self.end_code.rem_euclid(16) {
			0 => header::Rcode::NoError,
			1 => header::Rcode::FormErr,
			2 => header::Rcode::ServFail,
			3 => header::Rcode::NxDomain,
			4 => header::Rcode::NotImp,
			5 => header::Rcode::Refused,
			_ => header::Rcode::ServFail,
		};

		let flags = header::Flags::new(rcode, false, false, false, false, self.rd, false, true, header::Opcode::Query, true);

		let header = Header {
			id: self.id.into(),
			flags: flags.into(),
			qdcount: 1u16.into(),
			ancount: (self.answer.len() as u16).into(),
			nscount: (self.authority.len() as u16).into(),
			arcount: ((self.authority_extra_count()) as u16).into(),
		};

		self.response.extend_from_slice(as_slice(&header));

		let limit = match self.protocol {
			Protocol::Udp => self.edns.udp_resp_len as usize,
			Protocol::Tcp => wire::MAXMSG,
		};

		let mut table = wire::CompressionTable::new();
		let mut truncated = false;

		if wire::name::encode(&self.q_name, &mut table, &mut self.response).is_err() {
			truncated = true;
		}
		self.response.extend_from_slice(&self.q_type.to_be_bytes());
		self.response.extend_from_slice(&self.q_class.to_be_bytes());

		let mut packed_answer = 0u16;
		let mut packed_authority = 0u16;
		let mut packed_additional = 0u16;

		if !truncated {
			for rec in &self.answer {
				if !pack_record(&mut self.response, &mut table, rec, limit) {
					truncated = true;
					break;
				}
				packed_answer += 1;
			}
		}

		if !truncated {
			for rec in &self.authority {
				if !pack_record(&mut self.response, &mut table, rec, limit) {
					truncated = true;
					break;
				}
				packed_authority += 1;
			}
		}

		if !truncated {
			for rec in &self.additional {
				if !pack_record(&mut self.response, &mut table, rec, limit) {
					truncated = true;
					break;
				}
				packed_additional += 1;
			}
		}

		let edns_packed = !truncated && self.edns.present && pack_edns(&mut self.response, &self.edns, limit);
		if self.edns.present && !edns_packed {
			truncated = true;
		}

		if truncated {
			let flags = header::Flags::new(rcode, false, false, false, false, self.rd, true, true, header::Opcode::Query, true);
			let rewritten = Header {
				id: self.id.into(),
				flags: flags.into(),
				qdcount: 1u16.into(),
				ancount: packed_answer.into(),
				nscount: packed_authority.into(),
				arcount: (packed_additional + edns_packed as u16).into(),
			};
			self.response[..Header::SIZE].copy_from_slice(as_slice(&rewritten));
		}

		if self.protocol == Protocol::Tcp {
			let len = self.response.len() as u16;
			self.response.splice(0..0, len.to_be_bytes());
		}
	}

	fn authority_extra_count(&self) -> usize {
		self.additional.len() + self.edns.present as usize
	}
}

fn pack_record(out: &mut Vec<u8>, table: &mut wire::CompressionTable, rec: &Record, limit: usize) -> bool {
	let start = out.len();

	if wire::name::encode(&rec.name, table, out).is_err() {
		out.truncate(start);
		return false;
	}

	let rr_header = RrHeader { ty: rec.ty.into(), class: rec.class.into(), ttl: rec.ttl.into(), rdlength: (rec.rdata.len() as u16).into() };

	out.extend_from_slice(as_slice(&rr_header));
	out.extend_from_slice(&rec.rdata);

	if out.len() > limit {
		out.truncate(start);
		return false;
	}

	true
}

fn pack_edns(out: &mut Vec<u8>, edns: &Edns, limit: usize) -> bool {
	let start = out.len();
	let mut rdata = Vec::new();

	if let Some(subnet) = &edns.subnet {
		let data = subnet.to_bytes();
		rdata.extend_from_slice(&wire::edns::OPTION_CLIENT_SUBNET.to_be_bytes());
		rdata.extend_from_slice(&(data.len() as u16).to_be_bytes());
		rdata.extend_from_slice(&data);
	}

	out.push(0); // root name
	out.extend_from_slice(&wire::TYPE_OPT.to_be_bytes());
	out.extend_from_slice(&edns.udp_resp_len.to_be_bytes());
	out.extend_from_slice(&edns.ttl().to_be_bytes());
	out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
	out.extend_from_slice(&rdata);

	if out.len() > limit {
		out.truncate(start);
		return false;
	}

	true
}

/// Scans the additional-section records starting at `pos` for the first OPT
/// RR (empty name, type 41). Returns `None` when no OPT RR is present (EDNS
/// absent is not an error).
fn scan_for_opt(raw: &[u8], mut pos: usize) -> Option<wire::Result<Edns>> {
	while pos < raw.len() {
		let (name, name_len) = wire::name::decode(raw, pos).ok()?;
		pos += name_len;

		let rr_header = raw.get(pos..pos + rr::RrHeader::SIZE)?;
		let rr_header: &RrHeader = cast(rr_header);
		let ty = rr_header.ty.get();
		let class = rr_header.class.get();
		let ttl = rr_header.ttl.get();
		let rdlength = rr_header.rdlength.get() as usize;
		pos += rr::RrHeader::SIZE;

		let rdata = raw.get(pos..pos + rdlength)?;
		pos += rdlength;

		if ty == wire::TYPE_OPT && name.is_empty() {
			return Some(Edns::parse(class, ttl, rdata));
		}
	}

	None
}

#[cfg(test)]
mod tests {
	use super::*;

	fn build_query(id: u16, rd: bool, tc: bool, opcode: header::Opcode, name: &str) -> Vec<u8> {
		let mut table = wire::CompressionTable::new();
		let mut buf = Vec::new();

		let flags = header::Flags::new(header::Rcode::NoError, false, false, false, false, rd, tc, false, opcode, false);

		let hdr = Header { id: id.into(), flags: flags.into(), qdcount: 1u16.into(), ancount: 0u16.into(), nscount: 0u16.into(), arcount: 0u16.into() };

		buf.extend_from_slice(as_slice(&hdr));
		wire::name::encode(name, &mut table, &mut buf).unwrap();
		buf.extend_from_slice(&wire::TYPE_A.to_be_bytes());
		buf.extend_from_slice(&wire::CLASS_IN.to_be_bytes());

		buf
	}

	fn basic_a_query(id: u16, rd: bool) -> Vec<u8> {
		build_query(id, rd, false, header::Opcode::Query, "www.example.com")
	}

	#[test]
	fn parses_a_well_formed_a_query() {
		let raw = basic_a_query(0x1ff9, true);
		let mut q = Query::new(Protocol::Udp);

		q.parse(&raw);

		assert_eq!(q.end_code, end_code::IN_FLIGHT);
		assert_eq!(q.id, 0x1ff9);
		assert!(q.rd);
		assert_eq!(q.q_name, "www.example.com");
		assert_eq!(q.q_type, wire::TYPE_A);
	}

	#[test]
	fn short_header_is_rejected() {
		let mut q = Query::new(Protocol::Udp);
		q.parse(&[0u8; 4]);
		assert_eq!(q.end_code, end_code::SHORT_HEADER);
	}

	#[test]
	fn truncation_bit_in_request_suppresses_response() {
		let raw = build_query(1, false, true, header::Opcode::Query, "www.example.com");

		let mut q = Query::new(Protocol::Udp);
		q.parse(&raw);

		assert_eq!(q.end_code, end_code::TC_SET);
	}

	#[test]
	fn unsupported_opcode_is_notimp() {
		let raw = build_query(1, false, false, header::Opcode::IQuery, "example.com");

		let mut q = Query::new(Protocol::Udp);
		q.parse(&raw);

		assert_eq!(q.end_code, wire::header::Rcode::NotImp as i32);
	}

	#[test]
	fn pack_writes_a_well_formed_response() {
		let raw = basic_a_query(7, true);
		let mut q = Query::new(Protocol::Udp);
		q.parse(&raw);
		q.end_code = 0;
		q.answer.push(Record { name: q.q_name.clone(), ty: wire::TYPE_A, class: wire::CLASS_IN, ttl: 60, rdata: vec![127, 0, 0, 1] });

		q.pack();

		assert!(!q.response.is_empty());
		let hdr: &Header = cast(&q.response[..Header::SIZE]);
		assert_eq!(hdr.id.get(), 7);
		assert_eq!(hdr.ancount.get(), 1);
		assert!(hdr.flags.get().qr());
	}
}
