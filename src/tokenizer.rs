//! Tokenizer
//!
//! A scored-piece vocabulary with merge-based encoding: the text is seeded
//! as byte-level pieces, then the highest-scoring adjacent pair is merged
//! until no merge improves the score. The core engine treats the tokenizer
//! purely as an interface; this implementation exists so the binary runs end
//! to end.
//!
//! File format (little-endian): `magic u32`, `version u32`, `vocabSize u32`,
//! `maxPieceLen u32`, `bosId i32`, `eosId i32`, then per token
//! `{score f32, len u32, bytes}`.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;

use crate::error::{RepartirError, Result};

/// Tokenizer file magic
pub const TOKENIZER_MAGIC: u32 = 0x0A10_BEEF;
/// Tokenizer file version
pub const TOKENIZER_VERSION: u32 = 1;

/// Scored-piece vocabulary tokenizer
pub struct Tokenizer {
    /// Vocabulary size
    pub vocab_size: u32,
    /// Beginning-of-sequence token id (negative = none)
    pub bos_id: i32,
    /// End-of-sequence token ids
    pub eos_ids: Vec<u32>,
    pieces: Vec<String>,
    scores: Vec<f32>,
    lookup: HashMap<String, u32>,
}

impl Tokenizer {
    /// Load a tokenizer file
    pub fn load(path: &str) -> Result<Tokenizer> {
        let mut file = File::open(path).map_err(|e| {
            RepartirError::Tokenizer(format!("Cannot open tokenizer file ({path}): {e}"))
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Tokenizer::from_bytes(&data)
    }

    /// Parse a tokenizer from raw file bytes
    pub fn from_bytes(data: &[u8]) -> Result<Tokenizer> {
        let mut cursor = 0usize;
        let mut read_u32 = |cursor: &mut usize| -> Result<u32> {
            let end = *cursor + 4;
            if end > data.len() {
                return Err(RepartirError::Tokenizer("Truncated tokenizer file".to_string()));
            }
            let v = u32::from_le_bytes(data[*cursor..end].try_into().expect("u32"));
            *cursor = end;
            Ok(v)
        };

        let magic = read_u32(&mut cursor)?;
        if magic != TOKENIZER_MAGIC {
            return Err(RepartirError::Tokenizer(format!(
                "Invalid tokenizer magic: 0x{magic:X}"
            )));
        }
        let version = read_u32(&mut cursor)?;
        if version != TOKENIZER_VERSION {
            return Err(RepartirError::Tokenizer(format!(
                "Unsupported tokenizer version: {version}"
            )));
        }
        let vocab_size = read_u32(&mut cursor)?;
        let _max_piece_len = read_u32(&mut cursor)?;
        let bos_id = read_u32(&mut cursor)? as i32;
        let eos_id = read_u32(&mut cursor)? as i32;

        let mut pieces = Vec::with_capacity(vocab_size as usize);
        let mut scores = Vec::with_capacity(vocab_size as usize);
        for _ in 0..vocab_size {
            let score_bits = read_u32(&mut cursor)?;
            let len = read_u32(&mut cursor)? as usize;
            if cursor + len > data.len() {
                return Err(RepartirError::Tokenizer("Truncated tokenizer piece".to_string()));
            }
            let piece = String::from_utf8_lossy(&data[cursor..cursor + len]).into_owned();
            cursor += len;
            scores.push(f32::from_bits(score_bits));
            pieces.push(piece);
        }

        let lookup: HashMap<String, u32> = pieces
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i as u32))
            .collect();

        Ok(Tokenizer {
            vocab_size,
            bos_id,
            eos_ids: if eos_id >= 0 { vec![eos_id as u32] } else { Vec::new() },
            pieces,
            scores,
            lookup,
        })
    }

    /// Encode text into token ids.
    ///
    /// `add_bos` prepends the BOS token when the vocabulary declares one.
    pub fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        let mut tokens: Vec<u32> = Vec::with_capacity(text.len() + 1);
        if add_bos && self.bos_id >= 0 {
            tokens.push(self.bos_id as u32);
        }

        // Seed with single-character pieces (byte fallback on miss).
        let mut seeded: Vec<u32> = Vec::with_capacity(text.len());
        for ch in text.chars() {
            let piece = ch.to_string();
            if let Some(&id) = self.lookup.get(&piece) {
                seeded.push(id);
            } else {
                for byte in piece.as_bytes() {
                    let fallback = format!("<0x{byte:02X}>");
                    let id = self.lookup.get(&fallback).copied().ok_or_else(|| {
                        RepartirError::Tokenizer(format!(
                            "No vocabulary entry for character {ch:?}"
                        ))
                    })?;
                    seeded.push(id);
                }
            }
        }

        // Repeatedly merge the best-scoring adjacent pair.
        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best_at = usize::MAX;
            let mut best_id = 0u32;
            for i in 0..seeded.len().saturating_sub(1) {
                let merged = format!(
                    "{}{}",
                    self.pieces[seeded[i] as usize],
                    self.pieces[seeded[i + 1] as usize]
                );
                if let Some(&id) = self.lookup.get(&merged) {
                    if self.scores[id as usize] > best_score {
                        best_score = self.scores[id as usize];
                        best_at = i;
                        best_id = id;
                    }
                }
            }
            if best_at == usize::MAX {
                break;
            }
            seeded[best_at] = best_id;
            seeded.remove(best_at + 1);
        }

        tokens.extend(seeded);
        Ok(tokens)
    }

    /// Decode one token into its piece
    pub fn decode(&self, token: u32) -> &str {
        self.pieces.get(token as usize).map_or("", String::as_str)
    }

    /// True when the token terminates generation
    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_ids.contains(&token)
    }
}

/// Serialize a vocabulary into tokenizer file bytes (used by tooling and
/// tests; the inverse of [`Tokenizer::from_bytes`]).
pub fn write_tokenizer_bytes(
    pieces: &[(&str, f32)],
    bos_id: i32,
    eos_id: i32,
) -> Vec<u8> {
    let max_piece_len = pieces.iter().map(|(p, _)| p.len()).max().unwrap_or(0) as u32;
    let mut out = Vec::new();
    out.extend_from_slice(&TOKENIZER_MAGIC.to_le_bytes());
    out.extend_from_slice(&TOKENIZER_VERSION.to_le_bytes());
    out.extend_from_slice(&(pieces.len() as u32).to_le_bytes());
    out.extend_from_slice(&max_piece_len.to_le_bytes());
    out.extend_from_slice(&bos_id.to_le_bytes());
    out.extend_from_slice(&eos_id.to_le_bytes());
    for (piece, score) in pieces {
        out.extend_from_slice(&score.to_bits().to_le_bytes());
        out.extend_from_slice(&(piece.len() as u32).to_le_bytes());
        out.extend_from_slice(piece.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tokenizer() -> Tokenizer {
        let pieces = [
            ("<s>", 0.0),
            ("</s>", 0.0),
            ("h", -10.0),
            ("i", -10.0),
            ("e", -10.0),
            ("l", -10.0),
            ("o", -10.0),
            ("he", -2.0),
            ("ll", -1.5),
            ("hell", -1.0),
            ("hello", -0.5),
            (" ", -10.0),
        ];
        let bytes = write_tokenizer_bytes(&pieces, 0, 1);
        Tokenizer::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_encode_merges_to_best_piece() {
        let tok = test_tokenizer();
        let ids = tok.encode("hello", false).unwrap();
        assert_eq!(ids, vec![10]);
        assert_eq!(tok.decode(10), "hello");
    }

    #[test]
    fn test_encode_with_bos() {
        let tok = test_tokenizer();
        let ids = tok.encode("hi", true).unwrap();
        assert_eq!(ids[0], 0);
        assert_eq!(&ids[1..], &[2, 3]);
    }

    #[test]
    fn test_eos_detection() {
        let tok = test_tokenizer();
        assert!(tok.is_eos(1));
        assert!(!tok.is_eos(2));
    }

    #[test]
    fn test_unknown_character_errors() {
        let tok = test_tokenizer();
        assert!(tok.encode("xyz", false).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = write_tokenizer_bytes(&[("a", 0.0)], -1, -1);
        bytes[0] ^= 0xFF;
        assert!(Tokenizer::from_bytes(&bytes).is_err());
    }
}
