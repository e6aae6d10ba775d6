use crate::{Error, Result, MAX_COMPRESSION_ENTRIES, MAX_COMPRESSION_OFFSET};

const SPECIALS: &[u8] = b".;\\()@$";

fn append_escaped(out: &mut String, label: &[u8]) {
	for &b in label {
		if SPECIALS.contains(&b) {
			out.push('\\');
			out.push(b as char);
		} else if (0x20..=0x7e).contains(&b) {
			out.push(b as char);
		} else {
			out.push_str(&format!("\\{:03}", b));
		}
	}
}

/// Decodes a name starting at `start`, following compression pointers. Returns the
/// decoded dotted name and the number of bytes consumed from `start` in the linear
/// stream — i.e. not counting any bytes jumped over via a pointer.
pub fn decode(msg: &[u8], start: usize) -> Result<(String, usize)> {
	let mut out = String::new();
	let mut pos = start;
	let mut jumped = false;
	let mut consumed = 0usize;
	let mut traversed = 0usize;
	let mut first = true;

	loop {
		let len = *msg.get(pos).ok_or(Error::Truncated)?;

		match len >> 6 {
			0b00 => {
				let label_len = (len & 0x3f) as usize;

				if label_len == 0 {
					if !jumped {
						consumed = pos + 1 - start;
					}
					break;
				}

				let label_start = pos + 1;
				let label_end = label_start + label_len;

				if label_end > msg.len() {
					return Err(Error::Truncated);
				}

				traversed += 1 + label_len;
				if traversed > msg.len() {
					return Err(Error::PointerLoop);
				}

				if !first {
					out.push('.');
				}
				first = false;

				append_escaped(&mut out, &msg[label_start..label_end]);

				if out.len() > 255 {
					return Err(Error::NameTooLong);
				}

				if !jumped {
					consumed = label_end - start;
				}

				pos = label_end;
			}
			0b11 => {
				let hi = (len & 0x3f) as usize;
				let lo = *msg.get(pos + 1).ok_or(Error::Truncated)? as usize;
				let ptr = (hi << 8) | lo;

				if ptr >= msg.len() {
					return Err(Error::BadPointer);
				}

				if !jumped {
					consumed = pos + 2 - start;
				}
				jumped = true;

				traversed += 2;
				if traversed > msg.len() {
					return Err(Error::PointerLoop);
				}

				pos = ptr;
			}
			_ => return Err(Error::BadPointer),
		}
	}

	Ok((out, consumed))
}

fn split_labels(name: &str) -> Result<Vec<Vec<u8>>> {
	if name.is_empty() {
		return Ok(Vec::new());
	}

	let mut labels = vec![Vec::new()];
	let mut chars = name.chars().peekable();

	while let Some(c) = chars.next() {
		match c {
			'.' => labels.push(Vec::new()),
			'\\' => match chars.peek() {
				Some(d) if d.is_ascii_digit() => {
					let mut digits = String::with_capacity(3);

					for _ in 0..3 {
						let d = chars.next().filter(char::is_ascii_digit).ok_or(Error::InvalidEscape)?;
						digits.push(d);
					}

					let byte: u8 = digits.parse().map_err(|_| Error::InvalidEscape)?;
					labels.last_mut().unwrap().push(byte);
				}
				Some(_) => labels.last_mut().unwrap().push(chars.next().unwrap() as u8),
				None => return Err(Error::InvalidEscape),
			},
			c if c.is_ascii() => labels.last_mut().unwrap().push(c as u8),
			_ => return Err(Error::InvalidEscape),
		}
	}

	for label in &labels {
		if label.len() > 63 {
			return Err(Error::LabelTooLong);
		}
	}

	Ok(labels)
}

/// A record of previously packed names and the offsets they were written at, scoped
/// to a single outgoing message.
#[derive(Default)]
pub struct CompressionTable {
	entries: Vec<(u16, Vec<Vec<u8>>)>,
}

impl CompressionTable {
	pub fn new() -> Self {
		Self::default()
	}

	fn find(&self, suffix: &[Vec<u8>]) -> Option<u16> {
		self.entries.iter().find(|(_, labels)| labels.as_slice() == suffix).map(|&(offset, _)| offset)
	}

	fn record(&mut self, offset: usize, suffix: &[Vec<u8>]) {
		if self.entries.len() >= MAX_COMPRESSION_ENTRIES || offset > MAX_COMPRESSION_OFFSET as usize {
			return;
		}

		self.entries.push((offset as u16, suffix.to_vec()));
	}
}

/// Encodes `name` into `out`, compressing against `table` where possible. `table`
/// is rooted at the start of the message `out` belongs to, so offsets recorded here
/// must be absolute positions within that message.
pub fn encode(name: &str, table: &mut CompressionTable, out: &mut Vec<u8>) -> Result<()> {
	let labels = split_labels(name)?;

	if labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1 > 255 {
		return Err(Error::NameTooLong);
	}

	for i in 0..labels.len() {
		let suffix = &labels[i..];

		if let Some(offset) = table.find(suffix) {
			let ptr = 0xc000u16 | offset;
			out.extend_from_slice(&ptr.to_be_bytes());
			return Ok(());
		}

		table.record(out.len(), suffix);

		out.push(labels[i].len() as u8);
		out.extend_from_slice(&labels[i]);
	}

	out.push(0);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_a_simple_name() {
		let mut table = CompressionTable::new();
		let mut buf = Vec::new();

		encode("www.example.com", &mut table, &mut buf).unwrap();

		let (decoded, consumed) = decode(&buf, 0).unwrap();

		assert_eq!(decoded, "www.example.com");
		assert_eq!(consumed, buf.len());
	}

	#[test]
	fn root_name_is_a_single_zero_byte() {
		let mut table = CompressionTable::new();
		let mut buf = Vec::new();

		encode("", &mut table, &mut buf).unwrap();

		assert_eq!(buf, vec![0]);
		assert_eq!(decode(&buf, 0).unwrap(), (String::new(), 1));
	}

	#[test]
	fn second_name_compresses_against_the_first() {
		let mut table = CompressionTable::new();
		let mut buf = Vec::new();

		encode("www.example.com", &mut table, &mut buf).unwrap();
		let first_len = buf.len();

		encode("ns.example.com", &mut table, &mut buf).unwrap();

		// "example.com" is shared, so only "ns" plus a 2-byte pointer is appended.
		assert_eq!(buf.len(), first_len + 1 + 2 + 2);

		let (decoded, _) = decode(&buf, first_len).unwrap();
		assert_eq!(decoded, "ns.example.com");
	}

	#[test]
	fn pointer_must_target_an_earlier_offset() {
		// A pointer whose target is beyond the buffer is rejected.
		let buf = [0xc0, 0xff];
		assert_eq!(decode(&buf, 0), Err(Error::BadPointer));
	}

	#[test]
	fn rejects_oversize_labels() {
		let name = format!("{}.com", "a".repeat(64));
		let mut table = CompressionTable::new();
		let mut buf = Vec::new();

		assert_eq!(encode(&name, &mut table, &mut buf), Err(Error::LabelTooLong));
	}

	#[test]
	fn escapes_special_characters() {
		let mut table = CompressionTable::new();
		let mut buf = Vec::new();

		encode(r"a\.b.com", &mut table, &mut buf).unwrap();
		let (decoded, _) = decode(&buf, 0).unwrap();

		assert_eq!(decoded, r"a\.b.com");
	}
}
