//! Multiple-choice question records.

use super::error::EvalError;
use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};

/// One tokenized question with its candidate continuations.
///
/// Row `c` of `input_ids` holds the shared prompt followed by choice `c`,
/// right-padded to a common length.
#[derive(Debug, Clone)]
pub struct Question {
    input_ids: Tensor,
    question_length: usize,
    choice_length: Vec<usize>,
    answer_idx: usize,
}

impl Question {
    pub fn new(
        input_ids: Tensor,
        question_length: usize,
        choice_length: Vec<usize>,
        answer_idx: usize,
    ) -> Result<Self> {
        let (n_choices, seq_len) = input_ids.dims2()?;
        let invalid = |msg: String| -> anyhow::Error { EvalError::InvalidQuestion(msg).into() };

        if n_choices == 0 || choice_length.is_empty() {
            return Err(invalid("question has no choices".to_string()));
        }
        if choice_length.len() != n_choices {
            return Err(invalid(format!(
                "{} choice lengths for {} input rows",
                choice_length.len(),
                n_choices
            )));
        }
        if question_length == 0 {
            return Err(invalid("empty question prefix".to_string()));
        }
        if answer_idx >= n_choices {
            return Err(invalid(format!(
                "answer index {answer_idx} out of range for {n_choices} choices"
            )));
        }
        for (idx, &len) in choice_length.iter().enumerate() {
            if len == 0 {
                return Err(invalid(format!("choice {idx} is empty")));
            }
            if question_length + len > seq_len {
                return Err(invalid(format!(
                    "choice {idx} ends at {} beyond sequence length {seq_len}",
                    question_length + len
                )));
            }
        }

        let input_ids = input_ids.to_dtype(DType::U32)?;
        let rows = input_ids.i((.., ..question_length))?.to_vec2::<u32>()?;
        if rows.iter().any(|row| row != &rows[0]) {
            return Err(invalid(
                "choices do not share an identical question prefix".to_string(),
            ));
        }

        Ok(Self {
            input_ids,
            question_length,
            choice_length,
            answer_idx,
        })
    }

    /// Build from per-choice token rows, right-padding with `pad_id`.
    pub fn from_rows(
        rows: &[Vec<u32>],
        question_length: usize,
        answer_idx: usize,
        pad_id: u32,
    ) -> Result<Self> {
        let seq_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        let choice_length = rows
            .iter()
            .map(|row| row.len().saturating_sub(question_length))
            .collect();
        let mut flat = Vec::with_capacity(rows.len() * seq_len);
        for row in rows {
            flat.extend_from_slice(row);
            flat.extend(std::iter::repeat(pad_id).take(seq_len - row.len()));
        }
        let input_ids = Tensor::from_vec(flat, (rows.len(), seq_len), &Device::Cpu)?;
        Self::new(input_ids, question_length, choice_length, answer_idx)
    }

    pub fn input_ids(&self) -> &Tensor {
        &self.input_ids
    }

    pub fn question_length(&self) -> usize {
        self.question_length
    }

    pub fn choice_length(&self) -> &[usize] {
        &self.choice_length
    }

    pub fn answer_idx(&self) -> usize {
        self.answer_idx
    }

    pub fn n_choices(&self) -> usize {
        self.choice_length.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(err: anyhow::Error) -> EvalError {
        err.downcast::<EvalError>().unwrap()
    }

    #[test]
    fn test_from_rows_pads_and_measures_choices() {
        let q = Question::from_rows(&[vec![1, 2, 3, 7], vec![1, 2, 3, 8, 9]], 3, 1, 0).unwrap();
        assert_eq!(q.input_ids().dims(), &[2, 5]);
        assert_eq!(q.choice_length(), &[1, 2]);
        assert_eq!(q.n_choices(), 2);
        let padded = q.input_ids().to_vec2::<u32>().unwrap();
        assert_eq!(padded[0], vec![1, 2, 3, 7, 0]);
    }

    #[test]
    fn test_answer_out_of_range_rejected() {
        let err = Question::from_rows(&[vec![1, 2, 3]], 2, 1, 0).unwrap_err();
        assert!(matches!(kind(err), EvalError::InvalidQuestion(_)));
    }

    #[test]
    fn test_no_choices_rejected() {
        let ids = Tensor::zeros((0, 4), DType::U32, &Device::Cpu).unwrap();
        let err = Question::new(ids, 2, vec![], 0).unwrap_err();
        assert!(matches!(kind(err), EvalError::InvalidQuestion(_)));
    }

    #[test]
    fn test_empty_choice_rejected() {
        let err = Question::from_rows(&[vec![1, 2], vec![1, 2, 5]], 2, 0, 0).unwrap_err();
        assert!(matches!(kind(err), EvalError::InvalidQuestion(_)));
    }

    #[test]
    fn test_diverging_prefix_rejected() {
        let err = Question::from_rows(&[vec![1, 2, 5], vec![1, 3, 6]], 2, 0, 0).unwrap_err();
        assert!(matches!(kind(err), EvalError::InvalidQuestion(_)));
    }
}
