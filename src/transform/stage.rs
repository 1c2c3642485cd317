//! Header-aware transform composed from the reassembler and the rewriter.

use crate::error::TransformError;
use crate::transform::reassembler::{Reassembler, RECORD_TERMINATOR};
use crate::transform::rewriter::{CellRewriter, Record, FIELD_SEPARATOR};

/// Where the stage is in the record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No record seen yet; the next one is the header.
    AwaitingHeader,
    /// Header emitted; every further record is rewritten.
    Streaming,
}

/// Byte-in/byte-out transform over a CSV stream.
///
/// The first record observed is passed through verbatim. Every later record
/// goes through the [`CellRewriter`]. Output is appended to a caller-supplied
/// buffer so the async driver decides when to flush it downstream.
#[derive(Debug)]
pub struct TransformStage {
    reassembler: Reassembler,
    rewriter: CellRewriter,
    phase: Phase,
    separator: char,
    terminator: u8,
    records: u64,
}

impl Default for TransformStage {
    fn default() -> Self {
        Self::new(CellRewriter::default())
    }
}

impl TransformStage {
    pub fn new(rewriter: CellRewriter) -> Self {
        Self {
            reassembler: Reassembler::new(RECORD_TERMINATOR),
            rewriter,
            phase: Phase::AwaitingHeader,
            separator: FIELD_SEPARATOR,
            terminator: RECORD_TERMINATOR,
            records: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Records emitted so far, header included.
    pub fn records_emitted(&self) -> u64 {
        self.records
    }

    /// Data records emitted so far, header excluded.
    pub fn data_records(&self) -> u64 {
        self.records.saturating_sub(1)
    }

    /// Feed one chunk, appending every record it completes to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<(), TransformError> {
        let TransformStage {
            reassembler,
            rewriter,
            phase,
            separator,
            terminator,
            records,
        } = self;
        for raw in reassembler.feed(chunk) {
            emit(raw, rewriter, phase, *separator, *terminator, records, out)?;
        }
        Ok(())
    }

    /// Flush the trailing fragment at end-of-input.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), TransformError> {
        let TransformStage {
            reassembler,
            rewriter,
            phase,
            separator,
            terminator,
            records,
        } = self;
        for raw in reassembler.finish() {
            emit(raw, rewriter, phase, *separator, *terminator, records, out)?;
        }
        Ok(())
    }
}

fn emit(
    raw: &[u8],
    rewriter: &CellRewriter,
    phase: &mut Phase,
    separator: char,
    terminator: u8,
    records: &mut u64,
    out: &mut Vec<u8>,
) -> Result<(), TransformError> {
    let line = std::str::from_utf8(raw).map_err(|e| TransformError::InvalidUtf8 {
        record: *records + 1,
        valid_up_to: e.valid_up_to(),
    })?;

    let is_header = *phase == Phase::AwaitingHeader;
    *phase = Phase::Streaming;

    let record = rewriter.rewrite(Record::parse(line, separator, is_header));
    record.write_to(out, separator, terminator);
    *records += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EXAMPLE: &[u8] = b"id,name\n1,alice\n2,\n";
    const EXPECTED: &[u8] = b"id,name\nx-1,x-alice\nx-2,\n";

    fn run_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
        let mut stage = TransformStage::default();
        let mut out = Vec::new();
        for chunk in chunks {
            stage.push(chunk, &mut out).unwrap();
        }
        stage.finish(&mut out).unwrap();
        out
    }

    #[test]
    fn test_example_single_chunk() {
        assert_eq!(run_chunks([EXAMPLE]), EXPECTED);
    }

    #[test]
    fn test_example_split_mid_row() {
        let chunks: [&[u8]; 3] = [b"id,na", b"me\n1,al", b"ice\n2,\n"];
        assert_eq!(run_chunks(chunks), EXPECTED);
    }

    #[test]
    fn test_one_byte_chunks() {
        assert_eq!(run_chunks(EXAMPLE.chunks(1)), EXPECTED);
    }

    #[test]
    fn test_empty_input() {
        let mut stage = TransformStage::default();
        let mut out = Vec::new();
        stage.finish(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(stage.phase(), Phase::AwaitingHeader);
        assert_eq!(stage.data_records(), 0);
    }

    #[test]
    fn test_header_only() {
        assert_eq!(run_chunks([&b"a,b\n"[..]]), b"a,b\n");
    }

    #[test]
    fn test_phase_moves_after_first_record() {
        let mut stage = TransformStage::default();
        let mut out = Vec::new();
        stage.push(b"id,na", &mut out).unwrap();
        assert_eq!(stage.phase(), Phase::AwaitingHeader);
        assert!(out.is_empty());
        stage.push(b"me\n", &mut out).unwrap();
        assert_eq!(stage.phase(), Phase::Streaming);
        assert_eq!(out, b"id,name\n");
    }

    #[test]
    fn test_unterminated_tail_is_rewritten() {
        assert_eq!(run_chunks([&b"h\n1,2"[..]]), b"h\nx-1,x-2\n");
    }

    #[test]
    fn test_record_counts() {
        let mut stage = TransformStage::default();
        let mut out = Vec::new();
        stage.push(EXAMPLE, &mut out).unwrap();
        stage.finish(&mut out).unwrap();
        assert_eq!(stage.records_emitted(), 3);
        assert_eq!(stage.data_records(), 2);
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let mut stage = TransformStage::default();
        let mut out = Vec::new();
        let err = stage.push(b"h\nok,\xff\xfe\n", &mut out).unwrap_err();
        match err {
            TransformError::InvalidUtf8 { record, valid_up_to } => {
                assert_eq!(record, 2);
                assert_eq!(valid_up_to, 3);
            }
        }
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let input = "h\nnaïve,ü\n".as_bytes();
        let expected = "h\nx-naïve,x-ü\n".as_bytes();
        assert_eq!(run_chunks(input.chunks(1)), expected);
    }

    fn csv_input() -> impl Strategy<Value = String> {
        let field = "[a-z0-9 ]{0,6}";
        let row = proptest::collection::vec(field, 1..5).prop_map(|f| f.join(","));
        proptest::collection::vec(row, 0..20).prop_map(|rows| {
            rows.into_iter().map(|r| r + "\n").collect::<String>()
        })
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_change_output(
            input in csv_input(),
            chunk_size in 1usize..32,
        ) {
            let bytes = input.as_bytes();
            let whole = run_chunks([bytes]);
            let single = run_chunks(bytes.chunks(1));
            let sized = run_chunks(bytes.chunks(chunk_size));
            prop_assert_eq!(&whole, &single);
            prop_assert_eq!(&whole, &sized);
        }

        #[test]
        fn prop_record_count_preserved(input in csv_input()) {
            let output = run_chunks([input.as_bytes()]);
            let in_records = input.matches('\n').count();
            let out_records = output.iter().filter(|&&b| b == b'\n').count();
            prop_assert_eq!(in_records, out_records);
        }

        #[test]
        fn prop_header_passes_through(input in csv_input(), chunk_size in 1usize..16) {
            let output = run_chunks(input.as_bytes().chunks(chunk_size));
            let in_header = input.split('\n').next().unwrap_or("");
            let out_text = String::from_utf8(output).unwrap();
            if !input.is_empty() {
                prop_assert_eq!(out_text.split('\n').next().unwrap_or(""), in_header);
            }
        }
    }
}
