// Payment intents
// `Recipient` is what callers ask for; `TempRecipient` is the builder's
// working copy, mutated across fee iterations

use serde::{Deserialize, Serialize};

use crate::crypto::rangeproof::MAX_MESSAGE_LEN;
use crate::crypto::{BlindingFactor, ExtKeyPair, PublicKey, SharedSecret};
use crate::error::InputError;
use crate::stealth::{StealthAddress, StealthKeyMeta};
use crate::types::{money_range, Amount, KeyId, OutputKind, Script};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    KeyId(KeyId),
    Stealth(StealthAddress),
    /// A fresh child key is derived per payment
    ExtKeyPair(ExtKeyPair),
    Script(Script),
}

impl Destination {
    pub fn is_stealth(&self) -> bool {
        matches!(self, Destination::Stealth(_))
    }
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub destination: Destination,
    pub kind: OutputKind,
    pub amount: Amount,
    pub subtract_fee: bool,
    pub narration: Option<String>,
    /// Payload for data-carrier outputs
    pub data: Vec<u8>,
}

impl Recipient {
    pub fn new(destination: Destination, kind: OutputKind, amount: Amount) -> Self {
        Self {
            destination,
            kind,
            amount,
            subtract_fee: false,
            narration: None,
            data: Vec::new(),
        }
    }

    pub fn data(data: Vec<u8>) -> Self {
        Self {
            destination: Destination::Script(Script::default()),
            kind: OutputKind::DataCarrier,
            amount: 0,
            subtract_fee: false,
            narration: None,
            data,
        }
    }

    pub fn subtract_fee(mut self) -> Self {
        self.subtract_fee = true;
        self
    }

    pub fn with_narration(mut self, narration: &str) -> Self {
        self.narration = Some(narration.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct TempRecipient {
    pub destination: Destination,
    pub kind: OutputKind,
    /// Amount before fee subtraction
    pub amount_selected: Amount,
    /// Amount after fee subtraction
    pub amount: Amount,
    pub subtract_fee: bool,
    /// Smaller half of a split output, exempt from fee subtraction
    pub split: bool,
    pub exempt_fee: bool,
    pub is_change: bool,
    pub is_mine: bool,
    pub narration: Option<String>,
    pub data: Vec<u8>,

    pub script: Script,
    /// One-time destination key
    pub dest_pubkey: Option<PublicKey>,
    pub ephemeral: Option<PublicKey>,
    pub prefix: Option<u32>,
    /// Range-proof nonce
    pub shared: Option<SharedSecret>,
    pub blind: Option<BlindingFactor>,
    /// Set when the destination is one of our own stealth addresses
    pub stealth_meta: Option<StealthKeyMeta>,
    /// Index into the transaction's outputs once materialized
    pub n: Option<usize>,
}

impl TempRecipient {
    pub fn from_recipient(r: &Recipient) -> Result<Self, InputError> {
        if r.amount < 0 {
            return Err(InputError::NegativeAmount(r.amount));
        }
        if !money_range(r.amount) {
            return Err(InputError::AmountOutOfRange(r.amount));
        }
        if r.kind != OutputKind::DataCarrier && r.amount == 0 {
            return Err(InputError::ZeroAmount);
        }
        if let Some(narration) = &r.narration {
            if narration.len() > MAX_MESSAGE_LEN {
                return Err(InputError::NarrationTooLong {
                    len: narration.len(),
                    max: MAX_MESSAGE_LEN,
                });
            }
        }
        Ok(Self::new(
            r.destination.clone(),
            r.kind,
            r.amount,
            r.subtract_fee,
            r.narration.clone(),
            r.data.clone(),
        ))
    }

    pub fn new(
        destination: Destination,
        kind: OutputKind,
        amount: Amount,
        subtract_fee: bool,
        narration: Option<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            destination,
            kind,
            amount_selected: amount,
            amount,
            subtract_fee,
            split: false,
            exempt_fee: false,
            is_change: false,
            is_mine: false,
            narration,
            data,
            script: Script::default(),
            dest_pubkey: None,
            ephemeral: None,
            prefix: None,
            shared: None,
            blind: None,
            stealth_meta: None,
            n: None,
        }
    }

    pub fn set_amount(&mut self, amount: Amount) {
        self.amount_selected = amount;
        self.amount = amount;
    }

    /// Reset to the selected amount, then take this recipient's share of
    /// `fee`. The first payer also takes the remainder.
    pub fn apply_sub_fee(&mut self, fee: Amount, payers: usize, first: &mut bool) -> bool {
        if self.kind == OutputKind::DataCarrier {
            return false;
        }
        self.amount = self.amount_selected;
        if !self.subtract_fee || self.exempt_fee || payers == 0 {
            return false;
        }
        let payers = payers as Amount;
        self.amount -= fee / payers;
        if *first {
            *first = false;
            self.amount -= fee % payers;
        }
        true
    }

    /// Follow-up data output carrying this recipient's stealth payload
    pub fn needs_data_output(&self) -> bool {
        self.kind == OutputKind::Standard && self.ephemeral.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp(amount: Amount, subtract: bool) -> TempRecipient {
        TempRecipient::new(
            Destination::KeyId(KeyId::default()),
            OutputKind::Standard,
            amount,
            subtract,
            None,
            Vec::new(),
        )
    }

    #[test]
    fn test_validation() {
        let dest = Destination::KeyId(KeyId::default());
        let r = Recipient::new(dest.clone(), OutputKind::Standard, -5);
        assert_eq!(
            TempRecipient::from_recipient(&r).unwrap_err(),
            InputError::NegativeAmount(-5)
        );

        let r = Recipient::new(dest.clone(), OutputKind::Blinded, 0);
        assert_eq!(TempRecipient::from_recipient(&r).unwrap_err(), InputError::ZeroAmount);

        let r = Recipient::new(dest, OutputKind::Standard, 10).with_narration(&"x".repeat(33));
        assert!(matches!(
            TempRecipient::from_recipient(&r),
            Err(InputError::NarrationTooLong { len: 33, .. })
        ));

        assert!(TempRecipient::from_recipient(&Recipient::data(vec![1, 2])).is_ok());
    }

    #[test]
    fn test_fee_split_remainder_on_first() {
        let mut a = temp(1_000, true);
        let mut b = temp(1_000, true);
        let mut c = temp(1_000, false);
        let mut first = true;

        assert!(a.apply_sub_fee(101, 2, &mut first));
        assert!(b.apply_sub_fee(101, 2, &mut first));
        assert!(!c.apply_sub_fee(101, 2, &mut first));

        assert_eq!(a.amount, 1_000 - 50 - 1);
        assert_eq!(b.amount, 1_000 - 50);
        assert_eq!(c.amount, 1_000);

        // Re-applying starts from the selected amount again
        let mut first = true;
        a.apply_sub_fee(10, 2, &mut first);
        assert_eq!(a.amount, 995);
    }

    #[test]
    fn test_exempt_recipient_keeps_amount() {
        let mut r = temp(500, true);
        r.exempt_fee = true;
        let mut first = true;
        assert!(!r.apply_sub_fee(100, 1, &mut first));
        assert_eq!(r.amount, 500);
        assert!(first);
    }
}
