//! Disconnect classification counters surfaced on `GET /ws-metrics`.

use std::collections::HashMap;
use std::sync::Mutex;

/// Close-code buckets the hub sorts every socket close into. `CodeOther`
/// carries the raw code so unrecognised close codes are still counted,
/// grouped under a `code_<n>` label like the original classifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    NormalClosure,
    GoingAway,
    AbnormalClosure,
    ServerError,
    Code(u16),
}

impl DisconnectReason {
    pub fn label(&self) -> String {
        match self {
            DisconnectReason::NormalClosure => "normal_closure".to_string(),
            DisconnectReason::GoingAway => "going_away".to_string(),
            DisconnectReason::AbnormalClosure => "abnormal_closure".to_string(),
            DisconnectReason::ServerError => "server_error".to_string(),
            DisconnectReason::Code(n) => format!("code_{n}"),
        }
    }

    pub fn from_close_code(code: Option<u16>) -> Self {
        match code {
            Some(1000) => DisconnectReason::NormalClosure,
            Some(1001) => DisconnectReason::GoingAway,
            Some(1006) => DisconnectReason::AbnormalClosure,
            Some(1011) => DisconnectReason::ServerError,
            Some(n) => DisconnectReason::Code(n),
            None => DisconnectReason::AbnormalClosure,
        }
    }
}

#[derive(Default)]
pub struct WsMetrics {
    counts: Mutex<HashMap<String, u64>>,
}

impl WsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, reason: &DisconnectReason) {
        let mut counts = self.counts.lock().expect("ws metrics lock poisoned");
        *counts.entry(reason.label()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counts.lock().expect("ws metrics lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_labels_known_close_codes() {
        let metrics = WsMetrics::new();
        metrics.record(&DisconnectReason::from_close_code(Some(1000)));
        metrics.record(&DisconnectReason::from_close_code(Some(1006)));
        metrics.record(&DisconnectReason::from_close_code(Some(1006)));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get("normal_closure"), Some(&1));
        assert_eq!(snapshot.get("abnormal_closure"), Some(&2));
    }

    #[test]
    fn unrecognised_code_is_grouped_by_number() {
        let metrics = WsMetrics::new();
        metrics.record(&DisconnectReason::from_close_code(Some(4400)));
        assert_eq!(metrics.snapshot().get("code_4400"), Some(&1));
    }

    #[test]
    fn missing_code_counts_as_abnormal() {
        let metrics = WsMetrics::new();
        metrics.record(&DisconnectReason::from_close_code(None));
        assert_eq!(metrics.snapshot().get("abnormal_closure"), Some(&1));
    }
}
