//! Streaming speech-to-text boundary. Concrete engines (whisper.cpp,
//! vosk, cloud APIs) are external collaborators; the loop only depends on
//! this lifecycle: `stream_start` → `stream_data`* → `transcribe`.

use crate::error::SttError;

/// A single ranked transcription hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
}

impl Transcript {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }

    /// Legacy single-string STT results are treated as `[(s, 1.0)]`.
    pub fn from_bare_string(text: impl Into<String>) -> Self {
        Self::new(text, 1.0)
    }
}

pub trait StreamingStt: Send {
    fn stream_start(&mut self, lang: &str) -> Result<(), SttError>;
    fn stream_data(&mut self, chunk: &[u8]) -> Result<(), SttError>;
    /// Returns hypotheses sorted by confidence descending, possibly empty.
    fn transcribe(&mut self) -> Result<Vec<Transcript>, SttError>;
    fn stream_stop(&mut self) -> Result<(), SttError> {
        Ok(())
    }
}

/// Runs the primary engine and, only if it returns empty, the fallback —
/// per spec the fallback "follows the same lifecycle in parallel and is
/// consulted only if the primary returns empty". STT errors are treated
/// as an empty transcription rather than propagated, per the failure
/// semantics in §4.7/§7.
pub fn transcribe_with_fallback(
    primary: &mut dyn StreamingStt,
    fallback: Option<&mut dyn StreamingStt>,
) -> Vec<Transcript> {
    let primary_result = primary.transcribe().unwrap_or_else(|_| Vec::new());
    if !primary_result.is_empty() {
        return sorted_desc(primary_result);
    }
    match fallback {
        Some(fb) => sorted_desc(fb.transcribe().unwrap_or_else(|_| Vec::new())),
        None => Vec::new(),
    }
}

fn sorted_desc(mut transcripts: Vec<Transcript>) -> Vec<Transcript> {
    transcripts.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    transcripts
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStt(Vec<Transcript>);
    impl StreamingStt for FixedStt {
        fn stream_start(&mut self, _lang: &str) -> Result<(), SttError> {
            Ok(())
        }
        fn stream_data(&mut self, _chunk: &[u8]) -> Result<(), SttError> {
            Ok(())
        }
        fn transcribe(&mut self) -> Result<Vec<Transcript>, SttError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn falls_back_only_when_primary_empty() {
        let mut primary = FixedStt(vec![]);
        let mut fallback = FixedStt(vec![Transcript::new("hello", 0.8)]);
        let result = transcribe_with_fallback(&mut primary, Some(&mut fallback));
        assert_eq!(result, vec![Transcript::new("hello", 0.8)]);
    }

    #[test]
    fn primary_nonempty_skips_fallback() {
        let mut primary = FixedStt(vec![Transcript::new("hi", 0.5)]);
        let mut fallback = FixedStt(vec![Transcript::new("should not be used", 0.9)]);
        let result = transcribe_with_fallback(&mut primary, Some(&mut fallback));
        assert_eq!(result, vec![Transcript::new("hi", 0.5)]);
    }

    #[test]
    fn results_sorted_by_confidence_desc() {
        let mut primary = FixedStt(vec![Transcript::new("a", 0.2), Transcript::new("b", 0.9)]);
        let result = transcribe_with_fallback(&mut primary, None);
        assert_eq!(result[0].text, "b");
    }
}
