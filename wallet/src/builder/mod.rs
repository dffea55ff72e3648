// Transaction Builder
// Selects coins, shapes outputs and iterates the fee until it covers the
// measured size, for standard, blinded and anonymous inputs alike

mod anon;
mod outputs;
mod standard;

use rand::{CryptoRng, RngCore};
use tracing::{debug, info, warn};

use crate::blinding::{assign_blinds, check_balance, designated_output};
use crate::chain::ChainState;
use crate::coin_selection::{select_coins, CoinCandidate, CoinControl};
use crate::config::{WalletConfig, ANON_FEE_MULTIPLIER};
use crate::crypto::{key_image, KeyImage};
use crate::error::{InputError, ResourceError, Result, WalletError};
use crate::keys::{KeyProvider, OwnershipKind};
use crate::recipient::{Destination, Recipient, TempRecipient};
use crate::records::{flags, OutputRecord, TransactionRecord};
use crate::ring::check_ring_params;
use crate::state::{SpendableCoin, WalletState};
use crate::stealth::{derive_spend_secret, StealthKeyMeta};
use crate::storage::WalletStorage;
use crate::transaction::Transaction;
use crate::types::{Amount, KeyId, OutPoint, OutputKind};

use outputs::{check_amounts, insert_change, materialize, split_lone_blinded};

/// Serialized size of a standard output paying a key id
const STANDARD_OUTPUT_SIZE: usize = 42;

/// Size assumed when deciding whether blinded change is worth keeping
const CHANGE_RELAY_SIZE: usize = 2048;

/// Kind of the outputs a transaction spends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Standard,
    Blinded,
    Anon,
}

impl InputKind {
    /// Kind of the coins spent, which is also the kind of the change
    pub fn output_kind(&self) -> OutputKind {
        match self {
            InputKind::Standard => OutputKind::Standard,
            InputKind::Blinded => OutputKind::Blinded,
            InputKind::Anon => OutputKind::Anonymous,
        }
    }

    fn record_flag(&self) -> u32 {
        match self {
            InputKind::Standard => flags::STANDARD_IN,
            InputKind::Blinded => flags::BLIND_IN,
            InputKind::Anon => flags::ANON_IN,
        }
    }
}

/// A finalized transaction and the record the wallet keeps for it
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub tx: Transaction,
    pub fee: Amount,
    pub record: TransactionRecord,
    /// Output index of the change, if any
    pub change_position: Option<usize>,
}

/// Builds one transaction against the wallet state. Holds everything the
/// build needs for its duration; the caller holds the wallet lock.
pub struct TransactionBuilder<'a> {
    chain: &'a dyn ChainState,
    keys: &'a dyn KeyProvider,
    storage: &'a WalletStorage,
    config: &'a WalletConfig,
    state: &'a mut WalletState,
}

/// Output of a converged fee loop
struct Converged {
    tx: Transaction,
    recipients: Vec<TempRecipient>,
    coins: Vec<SpendableCoin>,
    value_in: Amount,
    fee: Amount,
    change_position: Option<usize>,
    iterations: usize,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(
        chain: &'a dyn ChainState,
        keys: &'a dyn KeyProvider,
        storage: &'a WalletStorage,
        config: &'a WalletConfig,
        state: &'a mut WalletState,
    ) -> Self {
        Self {
            chain,
            keys,
            storage,
            config,
            state,
        }
    }

    /// Build a transaction paying `recipients` from coins of `kind`.
    ///
    /// With `sign` set the inputs are signed and the record is persisted;
    /// otherwise the result carries placeholder signatures and the wallet
    /// is left untouched apart from derived key indices.
    pub fn build<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        recipients: &[Recipient],
        kind: InputKind,
        coin_control: &CoinControl,
        sign: bool,
    ) -> Result<BuiltTransaction> {
        if recipients.is_empty() {
            return Err(InputError::NoRecipients.into());
        }
        if sign && self.keys.is_locked() {
            return Err(WalletError::Locked);
        }
        if kind == InputKind::Anon {
            check_ring_params(self.config.ring.ring_size, self.config.ring.inputs_per_sig)?;
        }

        let mut temps = recipients
            .iter()
            .map(TempRecipient::from_recipient)
            .collect::<std::result::Result<Vec<_>, InputError>>()?;
        for r in &temps {
            if r.kind == OutputKind::Standard
                && !r.subtract_fee
                && r.amount < self.config.fees.dust_threshold
            {
                return Err(InputError::Dust {
                    amount: r.amount,
                    threshold: self.config.fees.dust_threshold,
                }
                .into());
            }
        }
        if kind == InputKind::Standard && self.config.privacy.split_single_blind_output {
            split_lone_blinded(rng, &mut temps, self.config.privacy.fee_sub_exempt_threshold);
        }
        for r in temps.iter_mut() {
            self.expand(rng, r)?;
        }

        let converged = self.fee_loop(rng, temps, kind, coin_control)?;
        let Converged {
            mut tx,
            recipients: temps,
            coins,
            value_in,
            fee,
            change_position,
            iterations,
        } = converged;

        let value_out: Amount = temps
            .iter()
            .filter(|r| r.kind != OutputKind::DataCarrier)
            .map(|r| r.amount)
            .sum();
        if value_out + fee != value_in {
            return Err(WalletError::StateInconsistency(format!(
                "inputs {} do not equal outputs {} plus fee {}",
                value_in, value_out, fee
            )));
        }

        let mut spent_images = Vec::new();
        match kind {
            InputKind::Standard | InputKind::Blinded => {
                let (plain_in, in_commitments) = if kind == InputKind::Blinded {
                    (0, standard::input_commitments(&coins)?)
                } else {
                    (value_in, Vec::new())
                };
                let out_commitments: Vec<_> =
                    tx.outputs.iter().filter_map(|o| o.commitment().copied()).collect();
                if !check_balance(plain_in, &in_commitments, tx.plain_output_value() + fee, &out_commitments)? {
                    return Err(WalletError::StateInconsistency(
                        "output commitments do not balance the inputs".to_string(),
                    ));
                }
                if sign {
                    self.sign_standard_inputs(rng, &mut tx, &coins)?;
                }
            }
            InputKind::Anon => {
                spent_images = self.finalize_anon(rng, &mut tx, &coins, &temps, fee, sign)?;
            }
        }

        let txid = tx.txid()?;
        let mut record = TransactionRecord::new(txid);
        record.flags = kind.record_flag();
        record.fee = fee;
        record.inputs = match kind {
            InputKind::Anon => tx.inputs.iter().flat_map(|i| i.prevouts()).collect(),
            _ => coins.iter().map(|c| c.candidate.outpoint).collect(),
        };
        let (outputs, stealth_keys, owned_images) = self.output_records(&tx, &temps, sign)?;
        for output in outputs {
            record.insert_output(output);
        }

        if sign {
            let mut images = spent_images;
            images.extend(owned_images);
            self.persist(record.clone(), stealth_keys, images)?;
        }

        let size = tx.size()?;
        info!(
            txid = %txid,
            kind = ?kind,
            fee,
            size,
            inputs = coins.len(),
            outputs = tx.outputs.len(),
            iterations,
            signed = sign,
            "built transaction"
        );
        Ok(BuiltTransaction {
            tx,
            fee,
            record,
            change_position,
        })
    }

    fn fee_loop<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        mut temps: Vec<TempRecipient>,
        kind: InputKind,
        coin_control: &CoinControl,
    ) -> Result<Converged> {
        let config = self.config;
        let chain = self.chain;
        let fees = &config.fees;

        let coins = self
            .state
            .available_coins(chain, kind.output_kind(), coin_control, config);
        let candidates: Vec<CoinCandidate> = coins.iter().map(|c| c.candidate.clone()).collect();

        let mut value_out: Amount = temps
            .iter()
            .filter(|r| r.kind != OutputKind::DataCarrier)
            .map(|r| r.amount_selected)
            .sum();
        let is_payer = |r: &TempRecipient| r.subtract_fee && !r.exempt_fee && r.kind != OutputKind::DataCarrier;
        let subtract_count = temps.iter().filter(|r| is_payer(r)).count();
        let has_blinded_output = temps.iter().any(|r| r.kind.is_blinded());
        let with_fee_output = kind != InputKind::Standard || has_blinded_output;
        let multiplier = if kind == InputKind::Anon { ANON_FEE_MULTIPLIER } else { 1 };
        let lock_time = chain.best_height().max(0) as u32;

        let mut change_template: Option<TempRecipient> = None;
        let mut fee: Amount = 0;
        let mut sub_fee_tries = fees.sub_fee_tries;
        let mut pick_new_inputs = true;
        let mut selected: Vec<SpendableCoin> = Vec::new();
        let mut value_in: Amount = 0;

        for iteration in 1..=fees.max_fee_iterations {
            temps.retain(|r| !r.is_change);
            for r in temps.iter_mut() {
                r.amount = r.amount_selected;
            }

            let mut value_to_select = value_out + if subtract_count == 0 { fee } else { 0 };

            if pick_new_inputs {
                let selection = select_coins(
                    rng,
                    &candidates,
                    value_to_select,
                    coin_control,
                    &config.selection,
                    fees.change_threshold,
                )?;
                if selection.value < value_to_select {
                    // Input cap reached: the lone fee payer absorbs the shortfall
                    let shortfall = value_to_select - selection.value;
                    let payer = if subtract_count == 1 {
                        temps.iter_mut().find(|r| is_payer(r))
                    } else {
                        None
                    };
                    match payer {
                        Some(r) if r.amount_selected > shortfall => {
                            r.set_amount(r.amount_selected - shortfall);
                            value_out -= shortfall;
                            value_to_select -= shortfall;
                        }
                        _ => {
                            return Err(ResourceError::InsufficientFunds {
                                needed: value_to_select,
                                available: selection.value,
                            }
                            .into())
                        }
                    }
                }
                value_in = selection.value;
                selected = selection
                    .coins
                    .iter()
                    .map(|c| {
                        coins
                            .iter()
                            .find(|s| s.candidate.outpoint == c.outpoint)
                            .cloned()
                            .ok_or(InputError::UnknownInput(c.outpoint))
                    })
                    .collect::<std::result::Result<_, InputError>>()?;
            }

            let change = value_in - value_to_select;
            let fees_from_change = coin_control.fees_from_change
                && subtract_count > 0
                && change >= fees.min_final_change + fee;
            let change_amount = if fees_from_change { change - fee } else { change };

            let mut dust_fee = 0;
            let insert = match kind {
                InputKind::Standard => {
                    if change_amount > 0 && change_amount < fees.dust_threshold {
                        dust_fee = change_amount;
                        None
                    } else if change_amount > 0 {
                        Some(change_amount)
                    } else {
                        None
                    }
                }
                // Blinded change always exists to carry the balancing blind
                InputKind::Blinded | InputKind::Anon => {
                    if !has_blinded_output || change_amount > chain.minimum_relay_fee(CHANGE_RELAY_SIZE) {
                        Some(change_amount)
                    } else {
                        dust_fee = change_amount;
                        Some(0)
                    }
                }
            };

            let mut change_index = None;
            if let Some(amount) = insert {
                let mut change_r = match &change_template {
                    Some(template) => template.clone(),
                    None => {
                        let template = self.change_recipient(rng, kind, coin_control)?;
                        change_template = Some(template.clone());
                        template
                    }
                };
                change_r.set_amount(amount);
                change_index = Some(insert_change(rng, &mut temps, change_r, coin_control.change_position)?);
            }

            if subtract_count > 0 && !fees_from_change {
                let payers = temps.iter().filter(|r| is_payer(r)).count();
                let mut first = true;
                for r in temps.iter_mut() {
                    r.apply_sub_fee(fee, payers, &mut first);
                }
            }
            check_amounts(&temps, fees.dust_threshold)?;

            let input_blinds = if kind == InputKind::Blinded {
                standard::input_blinds(&selected)?
            } else {
                Vec::new()
            };
            let designated = if kind == InputKind::Anon {
                None
            } else {
                designated_output(&temps)
            };
            assign_blinds(rng, &mut temps, &input_blinds, designated)?;

            let fee_total = fee + dust_fee;
            let mut tx = Transaction::new(lock_time);
            tx.outputs = materialize(rng, &mut temps, with_fee_output.then_some(fee_total), coin_control)?;
            tx.inputs = match kind {
                InputKind::Standard | InputKind::Blinded => self.dummy_standard_inputs(&selected)?,
                InputKind::Anon => anon::dummy_anon_inputs(
                    selected.len(),
                    config.ring.ring_size,
                    config.ring.inputs_per_sig,
                ),
            };

            let size = tx.size()?;
            if size > fees.max_tx_size {
                return Err(WalletError::TooLarge {
                    size,
                    max: fees.max_tx_size,
                });
            }
            let needed = chain.minimum_required_fee(size, fees.confirm_target) * multiplier;
            let relay_minimum = chain.minimum_relay_fee(size);
            if needed < relay_minimum {
                return Err(WalletError::FeePolicy {
                    fee: needed,
                    minimum: relay_minimum,
                });
            }

            debug!(iteration, size, fee = fee_total, needed, value_in, "fee iteration");

            let change_value = change_index.map(|i| temps[i].amount).unwrap_or(0);

            if fee_total >= needed {
                if kind == InputKind::Standard
                    && change_index.is_none()
                    && subtract_count == 0
                    && pick_new_inputs
                {
                    // Enough absorbed dust to afford a change output after all
                    let with_change = chain
                        .minimum_required_fee(size + STANDARD_OUTPUT_SIZE, fees.confirm_target)
                        * multiplier;
                    if fee_total >= with_change + fees.dust_threshold {
                        fee = with_change;
                        pick_new_inputs = false;
                        continue;
                    }
                }

                if change_value > 0 && (subtract_count == 0 || fees_from_change) && fee_total > needed {
                    // Return the excess to change
                    fee = needed;
                    pick_new_inputs = false;
                    continue;
                }

                if kind == InputKind::Blinded
                    && config.privacy.force_blind_change_on_exact_match
                    && subtract_count > 0
                    && !fees_from_change
                    && standard::is_exact_match(&temps, fee_total, value_in)
                {
                    if sub_fee_tries == 0 || !standard::nudge_exact_match(&mut temps) {
                        return Err(ResourceError::SubFeeTriesExhausted.into());
                    }
                    sub_fee_tries -= 1;
                    value_out -= 1;
                    pick_new_inputs = false;
                    continue;
                }

                let change_position = change_index.and_then(|i| temps[i].n);
                return Ok(Converged {
                    tx,
                    recipients: temps,
                    coins: selected,
                    value_in,
                    fee: fee_total,
                    change_position,
                    iterations: iteration,
                });
            }

            if !pick_new_inputs {
                if sub_fee_tries == 0 {
                    return Err(ResourceError::SubFeeTriesExhausted.into());
                }
                sub_fee_tries -= 1;
            }

            let shortfall = needed - fee_total;
            if change_index.is_some()
                && (subtract_count == 0 || fees_from_change)
                && change_value - shortfall >= fees.min_final_change
            {
                // Change absorbs the extra fee
                fee = needed;
                pick_new_inputs = false;
                continue;
            }

            fee = needed;
            pick_new_inputs = subtract_count == 0;
        }

        Err(ResourceError::FeeIterationLimit(fees.max_fee_iterations).into())
    }

    /// Output records for every non-data recipient, the stealth metadata of
    /// owned one-time keys, and key images of owned anonymous outputs
    #[allow(clippy::type_complexity)]
    fn output_records(
        &self,
        tx: &Transaction,
        temps: &[TempRecipient],
        sign: bool,
    ) -> Result<(Vec<OutputRecord>, Vec<(KeyId, StealthKeyMeta)>, Vec<(KeyImage, OutPoint)>)> {
        let txid = tx.txid()?;
        let mut outputs = Vec::new();
        let mut stealth_keys = Vec::new();
        let mut images = Vec::new();

        for r in temps.iter().filter(|r| r.kind != OutputKind::DataCarrier) {
            let n = r.n.ok_or_else(|| {
                WalletError::StateInconsistency("recipient was never materialized".to_string())
            })?;
            let mut out = OutputRecord::new(n as u32, r.kind, r.amount);
            out.script = r.script.clone();
            out.narration = r.narration.clone();
            out.flags = flags::FROM_ME;

            // Judge by the paid script; an extended-key account owning the
            // destination does not make its derived child spendable here
            let ownership = match &r.destination {
                _ if !r.is_mine => OwnershipKind::No,
                Destination::Stealth(_) => self.state.is_mine(self.keys, &r.destination),
                _ => self.state.is_mine(self.keys, &Destination::Script(r.script.clone())),
            };
            match ownership {
                OwnershipKind::Spendable => out.flags |= flags::OWNED,
                OwnershipKind::WatchOnly => out.flags |= flags::OWNED | flags::WATCH_ONLY,
                OwnershipKind::No => {}
            }
            if r.is_change {
                out.flags |= flags::CHANGE;
            }
            if r.ephemeral.is_some() {
                out.flags |= flags::STEALTH;
            }

            out.stealth_address = r.stealth_meta.map(|m| m.address_id);
            out.key_id = r.dest_pubkey.map(|p| p.key_id()).or_else(|| r.script.key_id());
            out.commitment = tx.outputs.get(n).and_then(|o| o.commitment().copied());
            if out.is_owned() {
                out.blind = r.blind.clone();
            }

            if let (Some(meta), Some(dest)) = (r.stealth_meta, r.dest_pubkey) {
                stealth_keys.push((dest.key_id(), meta));
            }

            if r.kind == OutputKind::Anonymous {
                out.anon_pubkey = r.dest_pubkey;
                if sign && ownership == OwnershipKind::Spendable {
                    if let Some(image) = self.owned_key_image(r)? {
                        out.key_image = Some(image);
                        images.push((image, OutPoint::new(txid, n as u32)));
                    }
                }
            }
            outputs.push(out);
        }
        Ok((outputs, stealth_keys, images))
    }

    /// Key image of an anonymous output paid to one of our stealth addresses
    fn owned_key_image(&self, r: &TempRecipient) -> Result<Option<KeyImage>> {
        let (meta, shared, dest) = match (&r.stealth_meta, &r.shared, r.dest_pubkey) {
            (Some(meta), Some(shared), Some(dest)) => (meta, shared, dest),
            _ => return Ok(None),
        };
        let address = match self.state.stealth_addresses.get(&meta.address_id) {
            Some(address) => address,
            None => return Ok(None),
        };
        let spend = self.keys.get_private_key(&address.spend_key_id)?;
        let secret = derive_spend_secret(&spend, shared)?;
        Ok(Some(key_image(&dest, &secret)?))
    }

    /// Commit the record with its spent-flag updates, then install it
    fn persist(
        &mut self,
        record: TransactionRecord,
        stealth_keys: Vec<(KeyId, StealthKeyMeta)>,
        key_images: Vec<(KeyImage, OutPoint)>,
    ) -> Result<()> {
        let (mut update, _) = self.state.ledger.plan_record(record);
        update.key_images.extend(key_images);

        let mut batch = self.storage.begin();
        for record in update.records.values() {
            batch.put_record(record)?;
        }
        for (image, outpoint) in &update.key_images {
            batch.put_key_image(image, outpoint)?;
        }
        for (id, meta) in &stealth_keys {
            batch.put_stealth_key(id, meta)?;
        }
        batch.commit()?;

        self.state.ledger.apply(update);
        self.state.stealth_keys.extend(stealth_keys);
        Ok(())
    }

    /// Flag an owned output spent and persist it
    fn mark_spent(&mut self, outpoint: &OutPoint) -> Result<()> {
        let update = self.state.ledger.plan_mark_spent(outpoint);
        if update.records.is_empty() {
            return Ok(());
        }
        let mut batch = self.storage.begin();
        for record in update.records.values() {
            batch.put_record(record)?;
        }
        batch.commit()?;
        self.state.ledger.apply(update);
        warn!(%outpoint, "marked output spent, its key image belongs to another output");
        Ok(())
    }
}
