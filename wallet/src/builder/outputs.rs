// Output construction: destination expansion, change insertion, the lone
// blinded-output split and materialization into `TxOut`s

use rand::{CryptoRng, Rng, RngCore};
use tracing::debug;

use super::{InputKind, TransactionBuilder};
use crate::blinding::make_range_proof;
use crate::coin_selection::CoinControl;
use crate::error::{InputError, Result, WalletError};
use crate::keys::OwnershipKind;
use crate::recipient::{Destination, TempRecipient};
use crate::state::CHANGE_ACCOUNT;
use crate::stealth::{derive_destination, StealthKeyMeta};
use crate::transaction::{OutputData, TxOut};
use crate::types::{Amount, OutputKind, Script};

fn kind_name(kind: OutputKind) -> &'static str {
    match kind {
        OutputKind::Standard => "standard",
        OutputKind::Blinded => "blinded",
        OutputKind::Anonymous => "anonymous",
        OutputKind::DataCarrier => "data",
    }
}

impl<'a> TransactionBuilder<'a> {
    /// Resolve a recipient's destination into a script, and for stealth
    /// destinations a fresh one-time key and shared secret
    pub(super) fn expand<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        r: &mut TempRecipient,
    ) -> Result<()> {
        match r.kind {
            OutputKind::DataCarrier => return Ok(()),
            OutputKind::Standard => {}
            OutputKind::Blinded | OutputKind::Anonymous => {
                if !r.destination.is_stealth() {
                    return Err(InputError::UnsupportedDestination(kind_name(r.kind)).into());
                }
            }
        }

        let destination = r.destination.clone();
        match &destination {
            Destination::KeyId(id) => r.script = Script::for_key_id(id),
            Destination::Script(script) => {
                if script.is_empty() {
                    return Err(InputError::UnsupportedDestination(kind_name(r.kind)).into());
                }
                r.script = script.clone();
            }
            Destination::ExtKeyPair(ext) => {
                let child = self.state.next_ext_child(self.storage, ext)?;
                r.dest_pubkey = Some(child);
                r.script = Script::for_key_id(&child.key_id());
            }
            Destination::Stealth(address) => {
                let dest = derive_destination(rng, address)?;
                r.script = Script::for_key_id(&dest.dest_pubkey.key_id());
                r.dest_pubkey = Some(dest.dest_pubkey);
                r.ephemeral = Some(dest.ephemeral);
                r.prefix = dest.prefix;
                r.shared = Some(dest.shared);
                if self.state.owned_stealth(address).is_some() {
                    r.stealth_meta = Some(StealthKeyMeta {
                        address_id: address.id(),
                        ephemeral: dest.ephemeral,
                    });
                }
            }
        }
        r.is_mine = self.state.is_mine(self.keys, &destination) != OwnershipKind::No;
        Ok(())
    }

    /// Change recipient template with a zero amount.
    ///
    /// Change always takes the kind of the inputs: standard inputs give
    /// standard change to a fresh change key, blinded inputs give blinded
    /// change and anonymous inputs give anonymous change, both to the
    /// wallet's change stealth address. A caller-supplied change
    /// destination overrides the address but never the kind.
    pub(super) fn change_recipient<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        kind: InputKind,
        coin_control: &CoinControl,
    ) -> Result<TempRecipient> {
        let destination = match &coin_control.change_destination {
            Some(destination) => destination.clone(),
            None if kind == InputKind::Standard => {
                let (pubkey, path) = self.keys.derive_next_address(CHANGE_ACCOUNT)?;
                debug!(%path, "derived change key");
                Destination::KeyId(pubkey.key_id())
            }
            None => Destination::Stealth(self.state.change_stealth_address(self.keys, self.storage)?),
        };

        let mut change =
            TempRecipient::new(destination, kind.output_kind(), 0, false, None, Vec::new());
        change.is_change = true;
        self.expand(rng, &mut change)?;
        Ok(change)
    }
}

/// Insert `change` at the requested position, or a random one. A change
/// output never displaces a data output from directly after its owner.
pub(super) fn insert_change<R: Rng>(
    rng: &mut R,
    recipients: &mut Vec<TempRecipient>,
    change: TempRecipient,
    position: Option<usize>,
) -> Result<usize> {
    let mut pos = match position {
        Some(p) if p > recipients.len() => return Err(InputError::ChangePosition(p).into()),
        Some(p) => p,
        None => rng.gen_range(0..=recipients.len()),
    };
    if pos < recipients.len() && recipients[pos].kind == OutputKind::DataCarrier {
        pos += 1;
    }
    recipients.insert(pos, change);
    Ok(pos)
}

/// Split the only paying output of a standard-input send in two when it is
/// blinded, so no single commitment mirrors the plain input value.
///
/// Runs before expansion so each half gets its own one-time key.
pub(super) fn split_lone_blinded<R: Rng>(
    rng: &mut R,
    recipients: &mut Vec<TempRecipient>,
    exempt_threshold: Amount,
) -> bool {
    let paying: Vec<usize> = (0..recipients.len())
        .filter(|&i| recipients[i].kind != OutputKind::DataCarrier)
        .collect();
    if paying.len() != 1 || !recipients[paying[0]].kind.is_blinded() {
        return false;
    }

    let i = paying[0];
    let amount = recipients[i].amount_selected;
    let part = amount * rng.gen_range(1..100) / 100;
    if part <= 0 || part >= amount {
        return false;
    }

    let mut other = recipients[i].clone();
    other.narration = None;
    other.set_amount(part);
    recipients[i].set_amount(amount - part);

    let small = if part <= amount - part {
        &mut other
    } else {
        &mut recipients[i]
    };
    small.split = true;
    if small.subtract_fee && small.amount_selected < exempt_threshold {
        small.exempt_fee = true;
    }

    recipients.insert(i + 1, other);
    debug!(amount, part, "split lone blinded output");
    true
}

/// Reject outputs that are dust, or negative after fee subtraction
pub(super) fn check_amounts(recipients: &[TempRecipient], dust_threshold: Amount) -> Result<()> {
    for r in recipients {
        match r.kind {
            OutputKind::DataCarrier => {}
            OutputKind::Standard => {
                if r.amount < dust_threshold {
                    return Err(InputError::Dust {
                        amount: r.amount,
                        threshold: dust_threshold,
                    }
                    .into());
                }
            }
            OutputKind::Blinded | OutputKind::Anonymous => {
                if r.amount < 0 || (r.amount == 0 && !r.is_change) {
                    return Err(InputError::Dust {
                        amount: r.amount,
                        threshold: 1,
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}

fn stealth_payload(r: &TempRecipient, with_narration: bool) -> OutputData {
    OutputData {
        ephemeral: r.ephemeral,
        prefix: r.prefix,
        narration: if with_narration {
            r.narration.as_ref().map(|n| n.as_bytes().to_vec())
        } else {
            None
        },
        fee: None,
    }
}

/// Turn recipients into outputs and record each one's output index.
/// Blinded recipients must already carry their blinds.
pub(super) fn materialize<R: Rng>(
    rng: &mut R,
    recipients: &mut [TempRecipient],
    fee_output: Option<Amount>,
    coin_control: &CoinControl,
) -> Result<Vec<TxOut>> {
    let mut outputs = Vec::with_capacity(recipients.len() + 1);
    if let Some(fee) = fee_output {
        outputs.push(TxOut::Data {
            data: OutputData::fee(fee).encode(),
        });
    }

    for r in recipients.iter_mut() {
        r.n = Some(outputs.len());
        match r.kind {
            OutputKind::DataCarrier => outputs.push(TxOut::Data { data: r.data.clone() }),
            OutputKind::Standard => {
                outputs.push(TxOut::Standard {
                    value: r.amount,
                    script: r.script.clone(),
                });
                if r.needs_data_output() {
                    outputs.push(TxOut::Data {
                        data: stealth_payload(r, true).encode(),
                    });
                }
            }
            OutputKind::Blinded => {
                let (commitment, range_proof) = make_range_proof(rng, r, coin_control)?;
                outputs.push(TxOut::Blinded {
                    commitment,
                    script: r.script.clone(),
                    data: stealth_payload(r, false).encode(),
                    range_proof,
                });
            }
            OutputKind::Anonymous => {
                let pubkey = r.dest_pubkey.ok_or_else(|| {
                    WalletError::StateInconsistency("anonymous output without a one-time key".to_string())
                })?;
                let (commitment, range_proof) = make_range_proof(rng, r, coin_control)?;
                outputs.push(TxOut::Anon {
                    pubkey,
                    commitment,
                    data: stealth_payload(r, false).encode(),
                    range_proof,
                });
            }
        }
    }
    Ok(outputs)
}
