//! Transaction identity

use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique transaction id
///
/// `most_sig_bits` is the coordinator partition that owns the transaction and
/// `least_sig_bits` its sequence number inside that partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TxnId {
    pub most_sig_bits: u64,
    pub least_sig_bits: u64,
}

impl TxnId {
    pub const fn new(most_sig_bits: u64, least_sig_bits: u64) -> Self {
        Self {
            most_sig_bits,
            least_sig_bits,
        }
    }

    /// Coordinator partition owning this transaction
    pub fn partition(&self) -> u64 {
        self.most_sig_bits
    }

    pub fn sequence(&self) -> u64 {
        self.least_sig_bits
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.most_sig_bits, self.least_sig_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_order() {
        let a = TxnId::new(0, 1);
        assert_eq!(a.to_string(), "(0,1)");
        assert!(TxnId::new(0, 1) < TxnId::new(0, 2));
        assert!(TxnId::new(0, 9) < TxnId::new(1, 0));
        assert_eq!(TxnId::new(3, 4).partition(), 3);
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&TxnId::new(0, 7)).unwrap();
        assert_eq!(json, r#"{"most_sig_bits":0,"least_sig_bits":7}"#);
    }
}
