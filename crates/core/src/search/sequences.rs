/// Token history for every row of a batch, kept in lock-step.
///
/// Prompts are left-padded to a common length so all rows advance together.
/// [`Sequences::sequence`] hides that padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequences {
    rows: Vec<Vec<u32>>,
    pads: Vec<usize>,
    prompt_length: usize,
}

impl Sequences {
    /// One row per prompt, each repeated `num_beams` times.
    pub fn new(prompts: &[Vec<u32>], num_beams: usize, pad_token_id: u32) -> Self {
        let prompt_length = prompts.iter().map(Vec::len).max().unwrap_or(0);
        let mut rows = Vec::with_capacity(prompts.len() * num_beams);
        let mut pads = Vec::with_capacity(prompts.len() * num_beams);
        for prompt in prompts {
            let pad = prompt_length - prompt.len();
            let mut row = vec![pad_token_id; pad];
            row.extend_from_slice(prompt);
            for _ in 0..num_beams {
                rows.push(row.clone());
                pads.push(pad);
            }
        }
        Self {
            rows,
            pads,
            prompt_length,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Padded length shared by every row.
    pub fn sequence_length(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// Padded prompt length.
    pub fn prompt_length(&self) -> usize {
        self.prompt_length
    }

    /// Unpadded length of each row.
    pub fn sequence_lengths(&self) -> Vec<usize> {
        self.rows
            .iter()
            .zip(&self.pads)
            .map(|(row, pad)| row.len() - pad)
            .collect()
    }

    /// Row `index` without its left padding.
    pub fn sequence(&self, index: usize) -> &[u32] {
        &self.rows[index][self.pads[index]..]
    }

    /// Row `index` including its left padding.
    pub fn padded(&self, index: usize) -> &[u32] {
        &self.rows[index]
    }

    /// Tokens appended after the prompt.
    pub fn generated(&self, index: usize) -> &[u32] {
        &self.rows[index][self.prompt_length..]
    }

    /// Left padding of each row.
    pub fn pads(&self) -> &[usize] {
        &self.pads
    }

    /// Append one token per row.
    pub fn append(&mut self, tokens: &[u32]) {
        assert_eq!(tokens.len(), self.rows.len(), "one token per row");
        for (row, &t) in self.rows.iter_mut().zip(tokens) {
            row.push(t);
        }
    }

    /// Append `tokens.len() / num_rows` tokens to every row.
    pub fn append_many(&mut self, tokens: &[u32]) {
        let n = self.rows.len();
        assert!(n > 0 && tokens.len() % n == 0, "tokens must split evenly across rows");
        let per_row = tokens.len() / n;
        for (row, chunk) in self.rows.iter_mut().zip(tokens.chunks(per_row.max(1))) {
            row.extend_from_slice(chunk);
        }
    }

    /// Rebuild rows so row `j` continues old row `indices[j]`, then append `tokens`.
    pub fn reorder_and_append(&mut self, indices: &[u32], tokens: &[u32]) {
        assert_eq!(indices.len(), self.rows.len(), "one index per row");
        let old = std::mem::take(&mut self.rows);
        let old_pads = std::mem::take(&mut self.pads);
        for (&src, &t) in indices.iter().zip(tokens) {
            let mut row = old[src as usize].clone();
            row.push(t);
            self.rows.push(row);
            self.pads.push(old_pads[src as usize]);
        }
    }

    /// Remove the last `n` generated tokens from every row.
    pub fn drop_last(&mut self, n: usize) {
        let len = self.sequence_length();
        assert!(
            len >= self.prompt_length + n,
            "cannot drop {n} tokens, only {} generated",
            len - self.prompt_length
        );
        for row in &mut self.rows {
            row.truncate(len - n);
        }
    }
}
