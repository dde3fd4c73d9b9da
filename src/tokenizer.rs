/* ------------------------------------------------------------------ */
/* Processor: char-level vocabulary, special tokens, chat template   */
/* ------------------------------------------------------------------ */
//
// Id layout:
//   0 .. B          base vocabulary (special tokens first, then characters)
//   B               boundary (never emitted; row B anchors injection)
//   B+1 .. B+M      mask references <SEG_MASK_1> .. <SEG_MASK_M>
//
// B == vocab_size(). Mask-reference ids are virtual: they only have
// embedding rows while a vocabulary extension is live, which is why
// generated ids above B decode straight to a mask index.
//
// Encoding is a left-to-right scan where special tokens are atomic and
// everything else is one token per character, so for any split
// `text = a + b` at a character boundary outside a special token,
// encode(text) == encode(a) ++ encode(b). Prompt/label alignment relies on
// that.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{IMAGE_TOKEN, MASK_TOKEN_PREFIX, NUM_MASK_TOKENS};
use crate::error::{Error, Result};

pub const PAD: &str         = "<pad>";
pub const BOS: &str         = "<bos>";
pub const EOS: &str         = "<eos>";
pub const UNK: &str         = "<unk>";
pub const START_TURN: &str  = "<start_of_turn>";
pub const END_TURN: &str    = "<end_of_turn>";

const SPECIALS: [&str; 7] = [PAD, BOS, EOS, UNK, IMAGE_TOKEN, START_TURN, END_TURN];

/// Mask-reference token text for 1-based index `k`.
pub fn mask_token(k: usize) -> String {
    format!("{MASK_TOKEN_PREFIX}{k}>")
}

// ── Chat turns ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn header(self) -> &'static str {
        match self {
            Role::User      => "user",
            Role::Assistant => "model",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

// ── Batch encoding ─────────────────────────────────────────────────────────

/// Left-padded batch: every row ends at the last column.
#[derive(Debug, Clone)]
pub struct Encoding {
    pub ids: Vec<Vec<u32>>,
    pub mask: Vec<Vec<u32>>,
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
}

impl Encoding {
    pub fn seq_len(&self) -> usize {
        self.ids.first().map_or(0, |r| r.len())
    }

    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }

    /// Drops the last `n` columns (teacher forcing: inputs stop one
    /// token before the final target).
    pub fn truncate_tail(&self, n: usize, device: &Device) -> Result<Self> {
        let keep = self.seq_len().saturating_sub(n);
        let ids: Vec<Vec<u32>>  = self.ids.iter().map(|r| r[..keep].to_vec()).collect();
        let mask: Vec<Vec<u32>> = self.mask.iter().map(|r| r[..keep].to_vec()).collect();
        Self::from_rows(ids, mask, device)
    }

    /// Appends one real token per row (greedy decoding).
    pub fn push_column(&self, next: &[u32], device: &Device) -> Result<Self> {
        if next.len() != self.batch_size() {
            return Err(Error::config(format!(
                "{} new tokens for a batch of {}", next.len(), self.batch_size()
            )));
        }
        let mut ids = self.ids.clone();
        let mut mask = self.mask.clone();
        for ((row, m), &id) in ids.iter_mut().zip(mask.iter_mut()).zip(next) {
            row.push(id);
            m.push(1);
        }
        Self::from_rows(ids, mask, device)
    }

    fn from_rows(ids: Vec<Vec<u32>>, mask: Vec<Vec<u32>>, device: &Device) -> Result<Self> {
        let b = ids.len();
        let s = ids.first().map_or(0, |r| r.len());
        let flat_ids: Vec<u32>  = ids.iter().flatten().copied().collect();
        let flat_mask: Vec<u32> = mask.iter().flatten().copied().collect();
        let input_ids      = Tensor::from_vec(flat_ids, (b, s), device)?;
        let attention_mask = Tensor::from_vec(flat_mask, (b, s), device)?;
        Ok(Self { ids, mask, input_ids, attention_mask })
    }
}

// ── Persistent vocab file ──────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct VocabFile {
    vocab: Vec<String>,
    end_turn: String,
    image_tokens: usize,
    mask_tokens: usize,
}

// ── Tokenizer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: Vec<String>,
    token_to_id: HashMap<String, u32>,
    end_turn: String,
    image_tokens: usize,
    mask_tokens: usize,
    pub pad_id: u32,
    pub bos_id: u32,
    pub eos_id: u32,
    pub unk_id: u32,
    pub image_id: u32,
    pub end_turn_id: u32,
}

impl Tokenizer {
    /// Builds the vocabulary from every character seen in `corpus`, plus
    /// the characters of the chat template itself.
    pub fn from_text(corpus: &str, end_turn: &str, image_tokens: usize) -> Result<Self> {
        let mut chars: Vec<char> = corpus
            .chars()
            .chain("user model\n".chars())
            .chain(strip_specials(end_turn).chars())
            .collect();
        chars.sort();
        chars.dedup();

        let mut vocab: Vec<String> = SPECIALS.iter().map(|s| s.to_string()).collect();
        vocab.extend(chars.into_iter().map(String::from));
        Self::from_vocab(vocab, end_turn.to_string(), image_tokens, NUM_MASK_TOKENS)
    }

    fn from_vocab(
        vocab: Vec<String>,
        end_turn: String,
        image_tokens: usize,
        mask_tokens: usize,
    ) -> Result<Self> {
        let token_to_id: HashMap<String, u32> = vocab
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        let id = |t: &str| {
            token_to_id
                .get(t)
                .copied()
                .ok_or_else(|| Error::Tokenizer(format!("vocabulary is missing {t}")))
        };
        let (pad_id, bos_id, eos_id, unk_id) = (id(PAD)?, id(BOS)?, id(EOS)?, id(UNK)?);
        let (image_id, end_turn_id) = (id(IMAGE_TOKEN)?, id(END_TURN)?);
        id(START_TURN)?;
        let tok = Self {
            vocab,
            token_to_id,
            end_turn,
            image_tokens,
            mask_tokens,
            pad_id,
            bos_id,
            eos_id,
            unk_id,
            image_id,
            end_turn_id,
        };
        if image_tokens == 0 {
            return Err(Error::config("image_tokens must be positive"));
        }
        Ok(tok)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = VocabFile {
            vocab: self.vocab.clone(),
            end_turn: self.end_turn.clone(),
            image_tokens: self.image_tokens,
            mask_tokens: self.mask_tokens,
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let file: VocabFile = serde_json::from_str(&json)?;
        Self::from_vocab(file.vocab, file.end_turn, file.image_tokens, file.mask_tokens)
    }

    // ── Vocabulary boundary and mask references ─────────────────────────

    /// Base vocabulary size B; also the boundary id.
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn max_mask_tokens(&self) -> usize {
        self.mask_tokens
    }

    pub fn end_turn(&self) -> &str {
        &self.end_turn
    }

    pub fn image_tokens(&self) -> usize {
        self.image_tokens
    }

    pub fn mask_token_id(&self, k: usize) -> Result<u32> {
        if k == 0 || k > self.mask_tokens {
            return Err(Error::config(format!(
                "mask reference {k} outside 1..={}", self.mask_tokens
            )));
        }
        Ok((self.vocab_size() + k) as u32)
    }

    /// 1-based mask index for a generated id, if it lies above the boundary.
    pub fn mask_index(&self, id: u32) -> Option<usize> {
        let b = self.vocab_size();
        let id = id as usize;
        (id > b && id <= b + self.mask_tokens).then(|| id - b)
    }

    // ── encode / decode ─────────────────────────────────────────────────

    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut out = Vec::with_capacity(text.len());
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            if c == '<' {
                if let Some((ids, len)) = self.match_special(rest) {
                    out.extend(ids);
                    rest = &rest[len..];
                    continue;
                }
            }
            let key = c.to_string();
            out.push(self.token_to_id.get(&key).copied().unwrap_or(self.unk_id));
            rest = &rest[c.len_utf8()..];
        }
        out
    }

    fn match_special(&self, text: &str) -> Option<(Vec<u32>, usize)> {
        if let Some(tail) = text.strip_prefix(MASK_TOKEN_PREFIX) {
            let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() && tail[digits.len()..].starts_with('>') {
                if let Ok(k) = digits.parse::<usize>() {
                    if let Ok(id) = self.mask_token_id(k) {
                        return Some((vec![id], MASK_TOKEN_PREFIX.len() + digits.len() + 1));
                    }
                }
            }
        }
        for special in SPECIALS {
            if text.starts_with(special) {
                let id = *self.token_to_id.get(special)?;
                let ids = if special == IMAGE_TOKEN {
                    vec![id; self.image_tokens]
                } else {
                    vec![id]
                };
                return Some((ids, special.len()));
            }
        }
        None
    }

    pub fn decode(&self, ids: &[u32], skip_special: bool) -> String {
        let mut out = String::new();
        for &id in ids {
            if let Some(k) = self.mask_index(id) {
                out.push_str(&mask_token(k));
            } else if let Some(tok) = self.vocab.get(id as usize) {
                if skip_special && SPECIALS.contains(&tok.as_str()) {
                    continue;
                }
                out.push_str(tok);
            }
        }
        out
    }

    // ── Chat template ───────────────────────────────────────────────────

    /// `<bos>` then `<start_of_turn>{role}\n{content}{end_turn}` per turn,
    /// optionally followed by an open model turn.
    pub fn apply_chat_template(&self, turns: &[ChatTurn], add_generation_prompt: bool) -> String {
        let mut text = String::from(BOS);
        for turn in turns {
            text.push_str(START_TURN);
            text.push_str(turn.role.header());
            text.push('\n');
            text.push_str(&turn.content);
            text.push_str(&self.end_turn);
        }
        if add_generation_prompt {
            text.push_str(START_TURN);
            text.push_str(Role::Assistant.header());
            text.push('\n');
        }
        text
    }

    /// Encodes and left-pads a batch of texts.
    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S], device: &Device) -> Result<Encoding> {
        let rows: Vec<Vec<u32>> = texts.iter().map(|t| self.encode(t.as_ref())).collect();
        self.pad_batch(rows, device)
    }

    pub fn pad_batch(&self, rows: Vec<Vec<u32>>, device: &Device) -> Result<Encoding> {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut ids  = Vec::with_capacity(rows.len());
        let mut mask = Vec::with_capacity(rows.len());
        for row in rows {
            let pad = width - row.len();
            let mut r = vec![self.pad_id; pad];
            r.extend_from_slice(&row);
            let mut m = vec![0u32; pad];
            m.extend(std::iter::repeat(1u32).take(row.len()));
            ids.push(r);
            mask.push(m);
        }
        Encoding::from_rows(ids, mask, device)
    }
}

fn strip_specials(text: &str) -> String {
    SPECIALS.iter().fold(text.to_string(), |acc, s| acc.replace(s, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_END_TURN;

    fn tok() -> Tokenizer {
        Tokenizer::from_text("segment the red car please", DEFAULT_END_TURN, 2).unwrap()
    }

    #[test]
    fn specials_and_mask_refs_are_atomic() {
        let t = tok();
        let b = t.vocab_size() as u32;
        let ids = t.encode("car <SEG_MASK_3><end_of_turn>\n");
        assert_eq!(ids[4], b + 3);
        assert_eq!(ids[5], t.end_turn_id);
        assert_eq!(ids.len(), 7);
        assert_eq!(t.mask_index(b + 3), Some(3));
        assert_eq!(t.mask_index(b), None);
    }

    #[test]
    fn image_tag_expands_to_patch_placeholders() {
        let t = tok();
        let ids = t.encode("<image>\nred");
        assert_eq!(&ids[..2], &[t.image_id, t.image_id]);
        assert_eq!(ids.len(), 2 + 1 + 3);
    }

    #[test]
    fn out_of_range_mask_refs_fall_back_to_chars() {
        let t = tok();
        let ids = t.encode("<SEG_MASK_500>");
        assert!(ids.iter().all(|&id| (id as usize) < t.vocab_size()));
    }

    #[test]
    fn rendered_prompt_ends_with_encoded_target() {
        let t = tok();
        let content = format!("the car {}", mask_token(1));
        let prompt = t.apply_chat_template(
            &[ChatTurn::user("<image>\nsegment"), ChatTurn::assistant(content.clone())],
            false,
        );
        let full = t.encode(&prompt);
        let target = t.encode(&format!("{content}{}", t.end_turn()));
        assert!(full.ends_with(&target));
        assert_eq!(full[0], t.bos_id);
    }

    #[test]
    fn batch_is_left_padded() -> Result<()> {
        let t = tok();
        let enc = t.encode_batch(&["car", "red car"], &Device::Cpu)?;
        assert_eq!(enc.seq_len(), 7);
        assert_eq!(enc.mask[0], vec![0, 0, 0, 0, 1, 1, 1]);
        assert_eq!(enc.ids[0][..4], [t.pad_id; 4]);
        assert_eq!(enc.input_ids.dims(), &[2, 7]);
        let cut = enc.truncate_tail(1, &Device::Cpu)?;
        assert_eq!(cut.seq_len(), 6);
        let grown = cut.push_column(&[t.eos_id, t.eos_id], &Device::Cpu)?;
        assert_eq!(grown.mask[0], vec![0, 0, 0, 0, 1, 1, 1]);
        assert_eq!(grown.ids[1][6], t.eos_id);
        assert!(cut.push_column(&[t.eos_id], &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn decode_renders_mask_refs_and_skips_specials() {
        let t = tok();
        let b = t.vocab_size() as u32;
        let mut ids = t.encode("<bos>car");
        ids.push(b + 2);
        assert_eq!(t.decode(&ids, true), "car<SEG_MASK_2>");
        assert_eq!(t.decode(&ids, false), "<bos>car<SEG_MASK_2>");
    }

    #[test]
    fn vocab_round_trips_through_json() -> Result<()> {
        let t = tok();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vocab.json");
        t.save(&path)?;
        let back = Tokenizer::load(&path)?;
        assert_eq!(back.vocab_size(), t.vocab_size());
        assert_eq!(back.encode("red car"), t.encode("red car"));
        Ok(())
    }
}
