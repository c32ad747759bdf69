use crate::predictor::NO_PREDICTION;

// Accumulated accepted words for sentence mode. A label is accepted only when
// it is not the sentinel and differs from the immediately preceding accepted
// word, so a held pose does not repeat while non-adjacent repeats are kept.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    words: Vec<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: &str) -> bool {
        if label.is_empty() || label == NO_PREDICTION {
            return false;
        }
        if self.words.last().is_some_and(|last| last == label) {
            return false;
        }
        self.words.push(label.to_string());
        true
    }

    pub fn text(&self) -> String {
        self.words.join(" ")
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }
}
