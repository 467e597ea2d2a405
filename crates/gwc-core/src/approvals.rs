use crate::wire::PairingRequest;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approving,
    Approved,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approving => "approving",
            ApprovalStatus::Approved => "approved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalEntry {
    pub request: PairingRequest,
    pub status: ApprovalStatus,
}

/// Inbound contact requests seen during one pairing session, keyed by code.
///
/// Entries are never removed: approval only marks them, so the session keeps
/// its history. At most one approval per code may be in flight.
#[derive(Debug, Clone, Default)]
pub struct ApprovalBook {
    order: Vec<String>,
    requests: HashMap<String, PairingRequest>,
    in_flight: HashSet<String>,
    approved: HashSet<String>,
    last_error: Option<String>,
}

impl ApprovalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds unseen codes in poll order and refreshes details of known ones.
    /// Returns how many codes were new.
    pub fn merge(&mut self, requests: impl IntoIterator<Item = PairingRequest>) -> usize {
        let mut added = 0;
        for request in requests {
            if request.code.trim().is_empty() {
                continue;
            }
            match self.requests.get_mut(&request.code) {
                Some(existing) => *existing = request,
                None => {
                    self.order.push(request.code.clone());
                    self.requests.insert(request.code.clone(), request);
                    added += 1;
                }
            }
        }
        added
    }

    /// Reserves `code` for an approval call. False means the click is a no-op.
    pub fn begin(&mut self, code: &str) -> bool {
        if !self.requests.contains_key(code)
            || self.approved.contains(code)
            || self.in_flight.contains(code)
        {
            return false;
        }
        self.in_flight.insert(code.to_string());
        true
    }

    pub fn finish(&mut self, code: &str, result: Result<(), String>) {
        if !self.in_flight.remove(code) {
            return;
        }
        match result {
            Ok(()) => {
                self.approved.insert(code.to_string());
                self.last_error = None;
            }
            Err(error) => {
                self.last_error = Some(format!("{code}: {error}"));
            }
        }
    }

    pub fn request(&self, code: &str) -> Option<&PairingRequest> {
        self.requests.get(code)
    }

    pub fn status(&self, code: &str) -> Option<ApprovalStatus> {
        if !self.requests.contains_key(code) {
            return None;
        }
        Some(if self.approved.contains(code) {
            ApprovalStatus::Approved
        } else if self.in_flight.contains(code) {
            ApprovalStatus::Approving
        } else {
            ApprovalStatus::Pending
        })
    }

    pub fn is_approved(&self, code: &str) -> bool {
        self.approved.contains(code)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn entries(&self) -> Vec<ApprovalEntry> {
        self.order
            .iter()
            .filter_map(|code| {
                let request = self.requests.get(code)?;
                let status = self.status(code)?;
                Some(ApprovalEntry {
                    request: request.clone(),
                    status,
                })
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(code: &str) -> PairingRequest {
        PairingRequest {
            channel: "telegram".to_string(),
            code: code.to_string(),
            sender_name: None,
            message: None,
        }
    }

    #[test]
    fn merge_is_keyed_by_code_and_keeps_order() {
        let mut book = ApprovalBook::new();
        assert_eq!(book.merge(vec![request("b"), request("a")]), 2);

        let mut renamed = request("b");
        renamed.sender_name = Some("Ana".to_string());
        assert_eq!(book.merge(vec![request("a"), renamed, request("")]), 0);

        let entries = book.entries();
        let codes: Vec<&str> = entries.iter().map(|e| e.request.code.as_str()).collect();
        assert_eq!(codes, vec!["b", "a"]);
        assert_eq!(entries[0].request.sender_name.as_deref(), Some("Ana"));
    }

    #[test]
    fn only_one_approval_in_flight_per_code() {
        let mut book = ApprovalBook::new();
        book.merge(vec![request("abc")]);

        assert!(book.begin("abc"));
        assert!(!book.begin("abc"));
        assert_eq!(book.status("abc"), Some(ApprovalStatus::Approving));

        book.finish("abc", Ok(()));
        assert!(book.is_approved("abc"));
        assert!(!book.begin("abc"));
    }

    #[test]
    fn failed_approval_can_be_retried() {
        let mut book = ApprovalBook::new();
        book.merge(vec![request("abc")]);
        assert!(book.begin("abc"));
        book.finish("abc", Err("gateway unreachable".to_string()));

        assert_eq!(book.status("abc"), Some(ApprovalStatus::Pending));
        assert_eq!(book.last_error(), Some("abc: gateway unreachable"));
        assert!(book.begin("abc"));
    }

    #[test]
    fn approved_entries_survive_later_polls() {
        let mut book = ApprovalBook::new();
        book.merge(vec![request("abc")]);
        book.begin("abc");
        book.finish("abc", Ok(()));

        book.merge(Vec::new());
        assert_eq!(book.entries().len(), 1);
        assert_eq!(book.entries()[0].status, ApprovalStatus::Approved);
    }

    #[test]
    fn unknown_codes_are_rejected() {
        let mut book = ApprovalBook::new();
        assert!(!book.begin("nope"));
        book.finish("nope", Ok(()));
        assert!(!book.is_approved("nope"));
    }
}
