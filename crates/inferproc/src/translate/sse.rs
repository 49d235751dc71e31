//! Incremental server-sent-event record framing.
//!
//! Body events arrive at arbitrary byte boundaries; records are only complete
//! at a blank line. The buffer retains the residue of a partial record across
//! calls so translators can tolerate any slicing.

use bytes::{Buf, BytesMut};

#[derive(Debug, Default)]
pub struct SseBuffer {
	buf: BytesMut,
}

impl SseBuffer {
	pub fn push(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Pop the next complete record (without its terminating blank line), or
	/// None when only a partial record is buffered.
	pub fn next_record(&mut self) -> Option<String> {
		let (end, sep_len) = find_record_end(&self.buf)?;
		let record = String::from_utf8_lossy(&self.buf[..end]).into_owned();
		self.buf.advance(end + sep_len);
		Some(record)
	}

	/// Bytes held back waiting for the rest of a record.
	pub fn residue(&self) -> &[u8] {
		&self.buf
	}

	/// True when nothing but whitespace remains buffered.
	pub fn is_drained(&self) -> bool {
		self.buf.iter().all(|b| b.is_ascii_whitespace())
	}
}

fn find_record_end(buf: &[u8]) -> Option<(usize, usize)> {
	let mut i = 0;
	while i < buf.len() {
		if buf[i] == b'\n' {
			if buf.get(i + 1) == Some(&b'\n') {
				return Some((i, 2));
			}
			if buf.get(i + 1) == Some(&b'\r') && buf.get(i + 2) == Some(&b'\n') {
				return Some((i, 3));
			}
		}
		i += 1;
	}
	None
}

/// Extract the payload of the `data:` field lines of a record, or None for
/// records without data (comments, keep-alives).
pub fn data_payload(record: &str) -> Option<String> {
	let mut parts = Vec::new();
	for line in record.lines() {
		if let Some(rest) = line.strip_prefix("data:") {
			parts.push(rest.strip_prefix(' ').unwrap_or(rest));
		}
	}
	if parts.is_empty() {
		None
	} else {
		Some(parts.join("\n"))
	}
}
