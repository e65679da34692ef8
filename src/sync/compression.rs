use flate2::Compression;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use log::debug;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::SyncError;
use crate::model::Priority;

/// Compressed payloads whose probe ratio is above this are sent raw.
const INCOMPRESSIBLE_RATIO: f64 = 0.9;

/// Upper bound on decompressed size accepted from a peer (64MB).
const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
	None,
	Deflate,
	Zlib,
	Gzip,
}

/// What the optimizer should favor for the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPriority {
	/// Time pressure: fastest codec.
	Speed,
	Balanced,
	/// Constrained bandwidth: best ratio.
	Ratio,
}

impl CompressionPriority {
	/// Pick a priority from the batch's queue tier and the link quality.
	pub fn select(priority: Priority, constrained_bandwidth: bool) -> Self {
		match (priority, constrained_bandwidth) {
			(Priority::Critical, _) => CompressionPriority::Speed,
			(_, true) => CompressionPriority::Ratio,
			(Priority::High, false) => CompressionPriority::Speed,
			_ => CompressionPriority::Balanced,
		}
	}
}

/// Payload as transmitted to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedPayload {
	pub algorithm: Algorithm,
	pub level: u32,
	pub original_len: usize,
	pub bytes: Vec<u8>,
}

impl CompressedPayload {
	pub fn compressed_len(&self) -> usize {
		self.bytes.len()
	}

	/// Bytes saved compared to the raw payload.
	pub fn saved(&self) -> usize {
		self.original_len.saturating_sub(self.bytes.len())
	}

	pub fn decompress(&self) -> Result<Vec<u8>, SyncError> {
		let mut out = Vec::with_capacity(self.original_len);
		let read = match self.algorithm {
			Algorithm::None => return Ok(self.bytes.clone()),
			Algorithm::Deflate => {
				DeflateDecoder::new(&self.bytes[..]).take(MAX_DECOMPRESSED_SIZE).read_to_end(&mut out)
			}
			Algorithm::Zlib => {
				ZlibDecoder::new(&self.bytes[..]).take(MAX_DECOMPRESSED_SIZE).read_to_end(&mut out)
			}
			Algorithm::Gzip => {
				GzDecoder::new(&self.bytes[..]).take(MAX_DECOMPRESSED_SIZE).read_to_end(&mut out)
			}
		};
		read.map_err(|e| SyncError::Integrity(format!("failed to decompress payload: {}", e)))?;

		if out.len() != self.original_len {
			return Err(SyncError::Integrity(format!(
				"decompressed length {} does not match declared length {}",
				out.len(),
				self.original_len
			)));
		}
		Ok(out)
	}
}

/// Size-threshold payload compressor with a compressibility probe.
#[derive(Debug, Clone)]
pub struct Compressor {
	enabled: bool,
	threshold_bytes: usize,
	probe_bytes: usize,
}

impl Default for Compressor {
	fn default() -> Self {
		Self {
			enabled: true,
			threshold_bytes: 4096,
			probe_bytes: 4096,
		}
	}
}

impl Compressor {
	pub fn new(enabled: bool, threshold_bytes: usize, probe_bytes: usize) -> Self {
		Self {
			enabled,
			threshold_bytes,
			probe_bytes: probe_bytes.max(64),
		}
	}

	/// Estimated compressed/original ratio from a fast pass over a sample.
	pub fn probe(&self, data: &[u8]) -> f64 {
		if data.is_empty() {
			return 1.0;
		}
		let sample = &data[..data.len().min(self.probe_bytes)];
		match encode(Algorithm::Deflate, 1, sample) {
			Ok(compressed) => compressed.len() as f64 / sample.len() as f64,
			Err(_) => 1.0,
		}
	}

	/// Compress `data` when it is large and compressible enough, otherwise
	/// wrap it as [`Algorithm::None`].
	pub fn compress(&self, data: &[u8], priority: CompressionPriority) -> Result<CompressedPayload, SyncError> {
		let raw = || CompressedPayload {
			algorithm: Algorithm::None,
			level: 0,
			original_len: data.len(),
			bytes: data.to_vec(),
		};

		if !self.enabled || data.len() < self.threshold_bytes {
			return Ok(raw());
		}

		let ratio = self.probe(data);
		if ratio > INCOMPRESSIBLE_RATIO {
			debug!("Skipping compression of {} bytes, probe ratio {:.2}", data.len(), ratio);
			return Ok(raw());
		}

		let (algorithm, level) = match priority {
			CompressionPriority::Speed => (Algorithm::Deflate, 1),
			CompressionPriority::Balanced => (Algorithm::Zlib, 6),
			CompressionPriority::Ratio => (Algorithm::Gzip, 9),
		};
		let bytes = encode(algorithm, level, data)?;

		if bytes.len() >= data.len() {
			return Ok(raw());
		}

		debug!(
			"Compressed {} -> {} bytes with {:?} level {}",
			data.len(),
			bytes.len(),
			algorithm,
			level
		);
		Ok(CompressedPayload {
			algorithm,
			level,
			original_len: data.len(),
			bytes,
		})
	}
}

fn encode(algorithm: Algorithm, level: u32, data: &[u8]) -> Result<Vec<u8>, SyncError> {
	let level = Compression::new(level);
	let result = match algorithm {
		Algorithm::None => return Ok(data.to_vec()),
		Algorithm::Deflate => {
			let mut enc = DeflateEncoder::new(Vec::new(), level);
			enc.write_all(data).and_then(|_| enc.finish())
		}
		Algorithm::Zlib => {
			let mut enc = ZlibEncoder::new(Vec::new(), level);
			enc.write_all(data).and_then(|_| enc.finish())
		}
		Algorithm::Gzip => {
			let mut enc = GzEncoder::new(Vec::new(), level);
			enc.write_all(data).and_then(|_| enc.finish())
		}
	};
	result.map_err(|e| SyncError::Internal(format!("compression failed: {}", e)))
}
