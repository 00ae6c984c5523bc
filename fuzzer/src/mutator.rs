//! Byte-level mutation engine: a dictionary-aware mutator applying a small set of
//! classic fuzzer operators, plus splicing crossover.

use std::fs;
use std::path::Path;

use crate::rng::Rng;

/// Built-in tokens used when no `--dict` file is supplied or the file is empty.
const BUILTIN_DICT: &[&str] = &["{}", "[]", "GET", "SET", "POST", "%x%n"];

/// A flat list of byte-string tokens injected by the dict-insert operator.
#[derive(Debug, Clone)]
pub struct Dict {
    tokens: Vec<Vec<u8>>,
}

impl Dict {
    /// The built-in fallback dictionary.
    pub fn builtin() -> Self {
        Self {
            tokens: BUILTIN_DICT.iter().map(|s| s.as_bytes().to_vec()).collect(),
        }
    }

    /// Loads one token per line from `path`. Blank lines and lines starting with `#`
    /// (after leading whitespace) are skipped. Falls back to [`Dict::builtin`] if the
    /// resulting token list is empty.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let tokens: Vec<Vec<u8>> = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| {
                let t = l.trim_start();
                !t.is_empty() && !t.starts_with('#')
            })
            .map(|l| l.as_bytes().to_vec())
            .collect();
        if tokens.is_empty() {
            Ok(Self::builtin())
        } else {
            Ok(Self { tokens })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn pick<'a>(&'a self, rng: &mut Rng) -> &'a [u8] {
        &self.tokens[rng.gen_range(self.tokens.len())]
    }
}

impl Default for Dict {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Interesting 32-bit values used by the "interesting" operator: 0, 1, INT32_MAX, and
/// 0xDEADBEEF.
const INTERESTING_32: &[u32] = &[0x0000_0000, 0x0000_0001, 0x7fff_ffff, 0xdead_beef];

/// The 8- and 16-bit interesting tables are the same four values, truncated to width
/// (low byte / low word) rather than a separate classic-AFL table, so every width
/// writes a byte pattern of the same named values.
const INTERESTING_8: &[u8] = &[0x00, 0x01, 0xff, 0xef];
const INTERESTING_16: &[u16] = &[0x0000, 0x0001, 0xffff, 0xbeef];

#[derive(Clone, Copy, Debug)]
enum Op {
    BitFlip,
    ByteInsert,
    ByteDelete,
    ByteReplace,
    DictInsert,
    Arith,
    Interesting,
    FillRun,
}

const OPS: [Op; 8] = [
    Op::BitFlip,
    Op::ByteInsert,
    Op::ByteDelete,
    Op::ByteReplace,
    Op::DictInsert,
    Op::Arith,
    Op::Interesting,
    Op::FillRun,
];

/// Applies mutation operators to byte strings, clamping growth to `max_size`.
pub struct Mutator {
    rng: Rng,
    max_size: usize,
    dict: Dict,
}

impl Mutator {
    pub fn new(rng: Rng, max_size: usize, dict: Dict) -> Self {
        Self { rng, max_size, dict }
    }

    /// Produces one mutated copy of `input`. Applies `k` operators drawn uniformly from
    /// {bit-flip, byte-insert, byte-delete, byte-replace, dict-insert, arith,
    /// interesting, fill-run}, `k` uniform in `[1,4]`. An empty `input` is first seeded
    /// with one random byte so every operator has something to work on; the result is
    /// never empty and never exceeds `max_size`.
    pub fn mutate(&mut self, input: &[u8]) -> Vec<u8> {
        let mut buf = input.to_vec();
        if buf.is_empty() {
            buf.push(self.rng.next_byte());
        }

        let k = self.rng.gen_range_inclusive(1, 4);
        for _ in 0..k {
            let op = OPS[self.rng.gen_range(OPS.len())];
            self.apply(&mut buf, op);
            if buf.len() > self.max_size {
                buf.truncate(self.max_size);
            }
            if buf.is_empty() {
                buf.push(self.rng.next_byte());
            }
        }
        buf
    }

    fn apply(&mut self, buf: &mut Vec<u8>, op: Op) {
        match op {
            Op::BitFlip => {
                if !buf.is_empty() {
                    let i = self.rng.gen_range(buf.len());
                    let bit = self.rng.gen_range(8);
                    buf[i] ^= 1 << bit;
                }
            }
            Op::ByteInsert => {
                let n = self.rng.gen_range_inclusive(1, 32);
                let at = self.rng.gen_range_inclusive(0, buf.len());
                let bytes: Vec<u8> = (0..n).map(|_| self.rng.next_byte()).collect();
                splice_in(buf, at, &bytes, self.max_size);
            }
            Op::ByteDelete => {
                if buf.len() > 1 {
                    let n = self
                        .rng
                        .gen_range_inclusive(1, 16.min(buf.len().saturating_sub(1)).max(1));
                    let at = self.rng.gen_range(buf.len().saturating_sub(n) + 1);
                    buf.drain(at..at + n);
                }
            }
            Op::ByteReplace => {
                if !buf.is_empty() {
                    let n = self.rng.gen_range_inclusive(1, 16.min(buf.len()));
                    let at = self.rng.gen_range(buf.len() - n + 1);
                    for b in &mut buf[at..at + n] {
                        *b = self.rng.next_byte();
                    }
                }
            }
            Op::DictInsert => {
                if !self.dict.is_empty() {
                    let at = self.rng.gen_range_inclusive(0, buf.len());
                    let token = self.dict.pick(&mut self.rng).to_vec();
                    splice_in(buf, at, &token, self.max_size);
                }
            }
            Op::Arith => {
                if !buf.is_empty() {
                    let i = self.rng.gen_range(buf.len());
                    let delta: i16 = self.rng.gen_range_inclusive(0, 4) as i16 - 2;
                    buf[i] = (buf[i] as i16).wrapping_add(delta) as u8;
                }
            }
            Op::Interesting => {
                if !buf.is_empty() {
                    match self.rng.gen_range(3) {
                        0 => {
                            let i = self.rng.gen_range(buf.len());
                            buf[i] = INTERESTING_8[self.rng.gen_range(INTERESTING_8.len())];
                        }
                        1 if buf.len() >= 2 => {
                            let i = self.rng.gen_range(buf.len() - 1);
                            let v = INTERESTING_16[self.rng.gen_range(INTERESTING_16.len())];
                            buf[i..i + 2].copy_from_slice(&v.to_le_bytes());
                        }
                        _ if buf.len() >= 4 => {
                            let i = self.rng.gen_range(buf.len() - 3);
                            let v = INTERESTING_32[self.rng.gen_range(INTERESTING_32.len())];
                            buf[i..i + 4].copy_from_slice(&v.to_le_bytes());
                        }
                        _ => {
                            let i = self.rng.gen_range(buf.len());
                            buf[i] = INTERESTING_8[self.rng.gen_range(INTERESTING_8.len())];
                        }
                    }
                }
            }
            Op::FillRun => {
                let n = self.rng.gen_range_inclusive(1, 16);
                let at = self.rng.gen_range_inclusive(0, buf.len());
                let fill = self.rng.next_byte();
                splice_in(buf, at, &vec![fill; n], self.max_size);
            }
        }
    }

    /// Splices `a` and `b` at independently chosen cut points: the prefix of `a` up to
    /// its cut joined with the suffix of `b` from its cut. Result is clamped to
    /// `max_size` and never empty (falls back to a single random byte if both inputs
    /// are empty).
    pub fn crossover(&mut self, a: &[u8], b: &[u8]) -> Vec<u8> {
        if a.is_empty() && b.is_empty() {
            return vec![self.rng.next_byte()];
        }
        let cut_a = self.rng.gen_range_inclusive(0, a.len());
        let cut_b = self.rng.gen_range_inclusive(0, b.len());
        let mut out = Vec::with_capacity((cut_a + (b.len() - cut_b)).min(self.max_size));
        out.extend_from_slice(&a[..cut_a]);
        out.extend_from_slice(&b[cut_b..]);
        if out.len() > self.max_size {
            out.truncate(self.max_size);
        }
        if out.is_empty() {
            out.push(self.rng.next_byte());
        }
        out
    }
}

fn splice_in(buf: &mut Vec<u8>, at: usize, bytes: &[u8], max_size: usize) {
    let at = at.min(buf.len());
    buf.splice(at..at, bytes.iter().copied());
    if buf.len() > max_size {
        buf.truncate(max_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutate_never_exceeds_max_size() {
        let mut m = Mutator::new(Rng::new(1), 8, Dict::builtin());
        let input = vec![1u8, 2, 3, 4];
        for _ in 0..200 {
            let out = m.mutate(&input);
            assert!(out.len() <= 8);
            assert!(!out.is_empty());
        }
    }

    #[test]
    fn mutate_empty_input_stays_nonempty() {
        let mut m = Mutator::new(Rng::new(2), 16, Dict::builtin());
        for _ in 0..50 {
            let out = m.mutate(&[]);
            assert!(!out.is_empty());
        }
    }

    #[test]
    fn mutate_is_deterministic_for_same_seed() {
        let mut m1 = Mutator::new(Rng::new(99), 32, Dict::builtin());
        let mut m2 = Mutator::new(Rng::new(99), 32, Dict::builtin());
        let input = b"hello world".to_vec();
        for _ in 0..20 {
            assert_eq!(m1.mutate(&input), m2.mutate(&input));
        }
    }

    #[test]
    fn crossover_respects_max_size_and_nonempty() {
        let mut m = Mutator::new(Rng::new(3), 4, Dict::builtin());
        for _ in 0..100 {
            let out = m.crossover(b"abcdef", b"123456789");
            assert!(out.len() <= 4);
            assert!(!out.is_empty());
        }
    }

    #[test]
    fn crossover_of_two_empties_is_nonempty() {
        let mut m = Mutator::new(Rng::new(4), 8, Dict::builtin());
        let out = m.crossover(&[], &[]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn dict_load_skips_comments_and_blank_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("edgefuzz-dict-test-{}", std::process::id()));
        std::fs::write(&path, "# comment\n\nfoo\nbar\n").unwrap();
        let dict = Dict::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(dict.tokens.len(), 2);
        assert_eq!(dict.tokens[0], b"foo");
        assert_eq!(dict.tokens[1], b"bar");
    }

    #[test]
    fn dict_load_falls_back_to_builtin_when_empty() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("edgefuzz-dict-empty-{}", std::process::id()));
        std::fs::write(&path, "# only comments\n\n").unwrap();
        let dict = Dict::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(dict.tokens.len(), BUILTIN_DICT.len());
    }
}
