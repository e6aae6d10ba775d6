//! Stage 7 of the vector-loop. Treated as a pure function of the question;
//! swapping this out for a real resolver (cache, upstream forwarding,
//! zone lookup) changes nothing else about the pipeline.

use crate::query::{end_code, Protocol, Query, Record};

/// Always answers an A question with a fixed record set and NOERROR. Any
/// other already-decided `end_code` (an error from Stage 6) passes through
/// untouched.
pub fn resolve(q: &mut Query) {
	if q.end_code != end_code::IN_FLIGHT {
		return;
	}

	let ns_name = "ns.example.com".to_string();

	q.answer.push(Record { name: q.q_name.clone(), ty: wire::TYPE_A, class: wire::CLASS_IN, ttl: 60, rdata: vec![127, 0, 0, 1] });

	q.authority.push(Record { name: q.q_name.clone(), ty: wire::TYPE_NS, class: wire::CLASS_IN, ttl: 60, rdata: encode_name(&ns_name) });

	q.additional.push(Record { name: ns_name.clone(), ty: wire::TYPE_A, class: wire::CLASS_IN, ttl: 60, rdata: vec![127, 0, 0, 1] });

	q.additional.push(Record {
		name: ns_name,
		ty: wire::TYPE_AAAA,
		class: wire::CLASS_IN,
		ttl: 60,
		rdata: std::net::Ipv6Addr::LOCALHOST.octets().to_vec(),
	});

	q.end_code = 0;
}

/// NS rdata is itself a domain name, wire-encoded without compression (the
/// pack stage compresses names against its own table, not this one).
fn encode_name(name: &str) -> Vec<u8> {
	let mut table = wire::CompressionTable::new();
	let mut out = Vec::new();
	wire::name::encode(name, &mut table, &mut out).expect("static NS name always encodes");
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_an_in_flight_a_query() {
		let mut q = Query::new(Protocol::Udp);
		q.q_name = "www.example.com".to_string();
		q.q_type = wire::TYPE_A;
		q.q_class = wire::CLASS_IN;
		q.end_code = end_code::IN_FLIGHT;

		resolve(&mut q);

		assert_eq!(q.end_code, 0);
		assert_eq!(q.answer.len(), 1);
		assert_eq!(q.answer[0].rdata, vec![127, 0, 0, 1]);
		assert_eq!(q.authority.len(), 1);
		assert_eq!(q.additional.len(), 2);
	}

	#[test]
	fn leaves_already_failed_queries_alone() {
		let mut q = Query::new(Protocol::Udp);
		q.end_code = end_code::SHORT_HEADER;

		resolve(&mut q);

		assert_eq!(q.end_code, end_code::SHORT_HEADER);
		assert!(q.answer.is_empty());
	}
}
