//! Response-body decompression.
//!
//! The proxy forwards upstream body bytes as-is; when the upstream negotiated
//! `content-encoding: gzip` the translator needs plaintext, so each body event
//! is decoded before translation. Unknown encodings pass through raw.

use std::io::Read;

use flate2::read::MultiGzDecoder;

use crate::error::Error;

/// Decode one response-body event according to the recorded content encoding.
///
/// A truncated gzip stream is a fatal [`Error::Decompress`]; an empty event
/// (common on the final end-of-stream frame) decodes to empty.
pub fn decode_body(encoding: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
	if body.is_empty() {
		return Ok(Vec::new());
	}
	match encoding {
		"gzip" => {
			let mut decoder = MultiGzDecoder::new(body);
			let mut out = Vec::new();
			decoder.read_to_end(&mut out).map_err(Error::Decompress)?;
			Ok(out)
		},
		_ => Ok(body.to_vec()),
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use flate2::write::GzEncoder;
	use flate2::Compression;

	use super::*;

	fn gzip(data: &[u8]) -> Vec<u8> {
		let mut enc = GzEncoder::new(Vec::new(), Compression::default());
		enc.write_all(data).unwrap();
		enc.finish().unwrap()
	}

	#[test]
	fn decodes_gzip() {
		let compressed = gzip(b"hello world");
		assert_eq!(decode_body("gzip", &compressed).unwrap(), b"hello world");
	}

	#[test]
	fn passes_through_identity_and_unknown() {
		assert_eq!(decode_body("", b"raw").unwrap(), b"raw");
		assert_eq!(decode_body("zstd", b"raw").unwrap(), b"raw");
	}

	#[test]
	fn truncated_gzip_is_fatal() {
		let mut compressed = gzip(b"hello world, this should not fit in half a stream");
		compressed.truncate(compressed.len() / 2);
		assert!(matches!(
			decode_body("gzip", &compressed),
			Err(Error::Decompress(_))
		));
	}

	#[test]
	fn empty_body_decodes_to_empty() {
		assert_eq!(decode_body("gzip", b"").unwrap(), Vec::<u8>::new());
	}
}
