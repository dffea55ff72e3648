// End-to-end construction scenarios across the three input kinds

mod common;

use std::collections::HashSet;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use ringct_wallet::blinding::plain_commitment;
use ringct_wallet::crypto::pedersen::verify_tally;
use ringct_wallet::records::flags;
use ringct_wallet::ring::verify_ring;
use ringct_wallet::transaction::{TxIn, TxOut};
use ringct_wallet::types::Script;
use ringct_wallet::{
    ChainState, CoinControl, Destination, FeePolicy, InputError, InputKind, OutputKind, Recipient,
    ResourceError, WalletConfig, WalletError, COIN,
};

use common::*;

fn pay_foreign(amount: i64) -> Recipient {
    Recipient::new(Destination::KeyId(foreign_key_id()), OutputKind::Standard, amount)
}

#[test]
fn test_standard_payment_with_change() {
    let chain = new_chain();
    chain.write().unwrap().set_fee_policy(FeePolicy::Fixed(1_000));
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    let coin = fund_standard(&chain, &wallet, 10_000_000);

    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let built = wallet
        .build_with_rng(&mut rng, &[pay_foreign(5_000_000)], InputKind::Standard, &CoinControl::new(), true)
        .unwrap();

    assert_eq!(built.fee, 1_000);
    assert_eq!(built.tx.outputs.len(), 2);
    let change = built.change_position.expect("change output");
    assert_eq!(built.tx.outputs[change].value(), Some(4_999_000));
    assert_eq!(built.tx.outputs[1 - change].value(), Some(5_000_000));
    assert_eq!(built.tx.plain_output_value() + built.fee, 10_000_000);

    assert!(wallet.is_spent(&coin).unwrap());
    let record = wallet.get_record(&built.tx.txid().unwrap()).unwrap().unwrap();
    assert_eq!(record.fee, 1_000);
    assert!(record.has(flags::STANDARD_IN));
    let change_record = record.output(change as u32).unwrap();
    assert!(change_record.has(flags::CHANGE));
    assert!(change_record.is_owned());
}

#[test]
fn test_dust_payment_rejected() {
    let chain = new_chain();
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &wallet, 10_000_000);

    let err = wallet
        .build_transaction(&[pay_foreign(3)], InputKind::Standard, &CoinControl::new(), true)
        .unwrap_err();
    assert!(matches!(
        err,
        WalletError::Input(InputError::Dust {
            amount: 3,
            threshold: 546
        })
    ));
}

#[test]
fn test_subtract_fee_from_recipient() {
    let chain = new_chain();
    chain.write().unwrap().set_fee_policy(FeePolicy::Fixed(1_000));
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &wallet, 10_000_000);

    let mut rng = ChaCha20Rng::seed_from_u64(11);
    let built = wallet
        .build_with_rng(
            &mut rng,
            &[pay_foreign(5_000_000).subtract_fee()],
            InputKind::Standard,
            &CoinControl::new(),
            true,
        )
        .unwrap();

    assert_eq!(built.fee, 1_000);
    let change = built.change_position.expect("change output");
    assert_eq!(built.tx.outputs[change].value(), Some(5_000_000));
    assert_eq!(built.tx.outputs[1 - change].value(), Some(4_999_000));
}

#[test]
fn test_insufficient_funds() {
    let chain = new_chain();
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &wallet, COIN);

    let err = wallet
        .build_transaction(&[pay_foreign(2 * COIN)], InputKind::Standard, &CoinControl::new(), true)
        .unwrap_err();
    assert!(matches!(
        err,
        WalletError::ResourceExhausted(ResourceError::InsufficientFunds { .. })
    ));
}

#[test]
fn test_locked_wallet_cannot_sign() {
    let chain = new_chain();
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    let coin = fund_standard(&chain, &wallet, COIN);

    wallet.lock();
    let err = wallet
        .build_transaction(&[pay_foreign(COIN / 2)], InputKind::Standard, &CoinControl::new(), true)
        .unwrap_err();
    assert!(matches!(err, WalletError::Locked));
    assert!(!wallet.is_spent(&coin).unwrap());

    // Fee estimation needs no keys
    let (_, fee) = wallet
        .build_transaction(&[pay_foreign(COIN / 2)], InputKind::Standard, &CoinControl::new(), false)
        .unwrap();
    assert!(fee > 0);
}

#[test]
fn test_unsigned_build_leaves_wallet_untouched() {
    let chain = new_chain();
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    let coin = fund_standard(&chain, &wallet, COIN);
    let before = wallet.get_balances().unwrap();

    let (tx, _) = wallet
        .build_transaction(&[pay_foreign(COIN / 2)], InputKind::Standard, &CoinControl::new(), false)
        .unwrap();

    assert!(wallet.get_record(&tx.txid().unwrap()).unwrap().is_none());
    assert!(!wallet.is_spent(&coin).unwrap());
    assert_eq!(wallet.get_balances().unwrap(), before);
    assert_eq!(before.standard, COIN);
}

#[test]
fn test_coin_control_pins_inputs() {
    let chain = new_chain();
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &wallet, COIN);
    let pinned = fund_standard(&chain, &wallet, 2 * COIN);

    let mut coin_control = CoinControl::new();
    coin_control.allow_other_inputs = false;
    coin_control.select(pinned);
    let (tx, _) = wallet
        .build_transaction(&[pay_foreign(COIN / 2)], InputKind::Standard, &coin_control, false)
        .unwrap();

    let prevouts: Vec<_> = tx.inputs.iter().flat_map(TxIn::prevouts).collect();
    assert_eq!(prevouts, vec![pinned]);
}

#[test]
fn test_ext_key_destination_derives_fresh_scripts() {
    let chain = new_chain();
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    let (_payee, payee_keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &wallet, COIN);
    let ext = payee_keys.account_ext(7).unwrap();

    let amount = COIN / 4;
    let mut scripts: Vec<Script> = Vec::new();
    for _ in 0..2 {
        let recipient = Recipient::new(Destination::ExtKeyPair(ext.clone()), OutputKind::Standard, amount);
        let (tx, _) = wallet
            .build_transaction(&[recipient], InputKind::Standard, &CoinControl::new(), false)
            .unwrap();
        let script = tx
            .outputs
            .iter()
            .find(|o| o.value() == Some(amount))
            .and_then(TxOut::script)
            .cloned()
            .unwrap();
        scripts.push(script);
    }
    assert_ne!(scripts[0], scripts[1]);
}

#[test]
fn test_blinded_spend_balances() {
    let chain = new_chain();
    {
        let mut chain = chain.write().unwrap();
        chain.set_fee_policy(FeePolicy::Fixed(10));
        chain.set_relay_fee_per_kb(0);
    }
    let (faucet, _) = new_wallet(&chain, unsplit_config());
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &faucet, COIN);
    fund_private(&chain, &faucet, &wallet, OutputKind::Blinded, 100);

    let coins = wallet.available_coins(OutputKind::Blinded, &CoinControl::new()).unwrap();
    assert_eq!(coins.len(), 1);
    assert_eq!(coins[0].output.value, 100);
    let input_commitment = coins[0].output.commitment.unwrap();

    let first = faucet.new_stealth_address(None).unwrap();
    let second = faucet.new_stealth_address(None).unwrap();
    let recipients = [
        Recipient::new(Destination::Stealth(first), OutputKind::Blinded, 60),
        Recipient::new(Destination::Stealth(second), OutputKind::Blinded, 40).subtract_fee(),
    ];
    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let built = wallet
        .build_with_rng(&mut rng, &recipients, InputKind::Blinded, &CoinControl::new(), true)
        .unwrap();

    assert_eq!(built.fee, 10);
    assert_eq!(built.tx.declared_fee(), Some(10));
    let mut negative: Vec<_> = built
        .tx
        .outputs
        .iter()
        .filter_map(|o| o.commitment().copied())
        .collect();
    assert_eq!(negative.len(), 3);
    negative.push(plain_commitment(built.tx.plain_output_value() + built.fee).unwrap());
    assert!(verify_tally(&[input_commitment], &negative).unwrap());

    mine(&chain, &[&faucet, &wallet], &[built.tx.clone()]);

    let mut received: Vec<i64> = faucet
        .list_unspent(Some(OutputKind::Blinded))
        .unwrap()
        .into_iter()
        .map(|(_, output, _)| output.value)
        .collect();
    received.sort();
    assert_eq!(received, vec![30, 60]);
    assert_eq!(faucet.get_balances().unwrap().blinded, 90);
    assert_eq!(wallet.get_balances().unwrap().blinded, 0);
    assert!(wallet.is_spent(&coins[0].candidate.outpoint).unwrap());
}

#[test]
fn test_anon_spend_ring() {
    let chain = new_chain();
    let (faucet, _) = new_wallet(&chain, unsplit_config());
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    seed_decoys(&chain, 30);
    fund_standard(&chain, &faucet, 10 * COIN);
    fund_private(&chain, &faucet, &wallet, OutputKind::Anonymous, 1_000_000);
    mine_empty(&chain, 20);

    let coins = wallet.available_coins(OutputKind::Anonymous, &CoinControl::new()).unwrap();
    assert_eq!(coins.len(), 1);
    let coin = coins[0].clone();
    let real_index = chain
        .read()
        .unwrap()
        .anon_index_of(&coin.output.anon_pubkey.unwrap())
        .unwrap();

    let payee = faucet.new_stealth_address(None).unwrap();
    let recipient = Recipient::new(Destination::Stealth(payee), OutputKind::Anonymous, 400_000);
    let mut rng = ChaCha20Rng::seed_from_u64(21);
    let built = wallet
        .build_with_rng(&mut rng, &[recipient], InputKind::Anon, &CoinControl::new(), true)
        .unwrap();

    assert_eq!(built.tx.inputs.len(), 1);
    let (ring, signature) = match &built.tx.inputs[0] {
        TxIn::Anon {
            ring,
            split_commitment: None,
            signature,
        } => (ring, signature),
        other => panic!("unexpected input {:?}", other),
    };
    assert_eq!(ring.len(), 11);
    assert!(ring.iter().all(|column| column.len() == 1));
    let members: HashSet<u64> = ring.iter().map(|column| column[0]).collect();
    assert_eq!(members.len(), 11);
    assert_eq!(ring.iter().filter(|column| column[0] == real_index).count(), 1);
    assert_eq!(signature.key_images, vec![coin.output.key_image.unwrap()]);

    let message = built.tx.outputs_hash().unwrap();
    let mut commitments: Vec<_> = built
        .tx
        .outputs
        .iter()
        .filter_map(|o| o.commitment().copied())
        .collect();
    commitments.push(plain_commitment(built.tx.plain_output_value() + built.fee).unwrap());
    let guard = chain.read().unwrap();
    verify_ring(&*guard, ring, &message.0, signature, &commitments).unwrap();
    drop(guard);

    assert!(wallet.is_spent(&coin.candidate.outpoint).unwrap());
    let record = wallet.get_record(&built.tx.txid().unwrap()).unwrap().unwrap();
    assert!(record.has(flags::ANON_IN));
}

#[test]
fn test_anon_spend_needs_decoys() {
    let chain = new_chain();
    let (faucet, _) = new_wallet(&chain, unsplit_config());
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &faucet, 10 * COIN);
    fund_private(&chain, &faucet, &wallet, OutputKind::Anonymous, 1_000_000);
    mine_empty(&chain, 20);

    let payee = faucet.new_stealth_address(None).unwrap();
    let recipient = Recipient::new(Destination::Stealth(payee), OutputKind::Anonymous, 400_000);
    let err = wallet
        .build_transaction(&[recipient], InputKind::Anon, &CoinControl::new(), true)
        .unwrap_err();
    assert!(matches!(
        err,
        WalletError::ResourceExhausted(ResourceError::NotEnoughAnonOutputs { .. })
    ));
}

#[test]
fn test_blinded_exact_match_forces_change() {
    let chain = new_chain();
    {
        let mut chain = chain.write().unwrap();
        chain.set_fee_policy(FeePolicy::Fixed(1_000));
        chain.set_relay_fee_per_kb(0);
    }
    let (faucet, _) = new_wallet(&chain, unsplit_config());
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &faucet, COIN);
    fund_private(&chain, &faucet, &wallet, OutputKind::Blinded, 1_000_000);

    let coins = wallet.available_coins(OutputKind::Blinded, &CoinControl::new()).unwrap();
    assert_eq!(coins.len(), 1);
    let input_commitment = coins[0].output.commitment.unwrap();

    // Spending the whole input to a plain output would leave nothing blinded
    let mut rng = ChaCha20Rng::seed_from_u64(5);
    let built = wallet
        .build_with_rng(
            &mut rng,
            &[pay_foreign(1_000_000).subtract_fee()],
            InputKind::Blinded,
            &CoinControl::new(),
            true,
        )
        .unwrap();

    assert_eq!(built.fee, 1_000);
    assert_eq!(built.tx.plain_output_value(), 998_999);
    let change = built.change_position.expect("change output");
    let change_commitment = *built.tx.outputs[change].commitment().unwrap();
    let record = wallet.get_record(&built.tx.txid().unwrap()).unwrap().unwrap();
    let change_record = record.output(change as u32).unwrap();
    assert_eq!(change_record.kind, OutputKind::Blinded);
    assert_eq!(change_record.value, 1);
    assert!(change_record.has(flags::CHANGE));

    let negative = [change_commitment, plain_commitment(998_999 + 1_000).unwrap()];
    assert!(verify_tally(&[input_commitment], &negative).unwrap());
}

#[test]
fn test_fees_from_change_spare_recipient() {
    let chain = new_chain();
    chain.write().unwrap().set_fee_policy(FeePolicy::Fixed(1_000));
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &wallet, 10 * COIN);

    let mut coin_control = CoinControl::new();
    coin_control.fees_from_change = true;
    let mut rng = ChaCha20Rng::seed_from_u64(13);
    let built = wallet
        .build_with_rng(&mut rng, &[pay_foreign(COIN).subtract_fee()], InputKind::Standard, &coin_control, true)
        .unwrap();

    assert_eq!(built.fee, 1_000);
    assert_eq!(built.tx.outputs.len(), 2);
    let change = built.change_position.expect("change output");
    assert_eq!(built.tx.outputs[1 - change].value(), Some(COIN));
    assert_eq!(built.tx.outputs[change].value(), Some(9 * COIN - 1_000));
}

#[test]
fn test_input_cap_shortfall_comes_from_payer() {
    let chain = new_chain();
    chain.write().unwrap().set_fee_policy(FeePolicy::Fixed(1_000));
    let (wallet, _keys) = new_wallet(&chain, WalletConfig::default());
    fund_standard(&chain, &wallet, COIN);
    fund_standard(&chain, &wallet, COIN);

    let mut coin_control = CoinControl::new();
    coin_control.max_inputs = Some(1);
    let mut rng = ChaCha20Rng::seed_from_u64(17);
    let built = wallet
        .build_with_rng(
            &mut rng,
            &[pay_foreign(COIN + COIN / 2).subtract_fee()],
            InputKind::Standard,
            &coin_control,
            true,
        )
        .unwrap();

    assert_eq!(built.tx.inputs.len(), 1);
    assert_eq!(built.fee, 1_000);
    assert!(built.change_position.is_none());
    assert_eq!(built.tx.outputs.len(), 1);
    assert_eq!(built.tx.outputs[0].value(), Some(COIN - 1_000));
}

#[test]
fn test_anon_spend_split_commitments() {
    let chain = new_chain();
    let mut config = WalletConfig::default();
    config.ring.inputs_per_sig = 1;
    let (faucet, _) = new_wallet(&chain, unsplit_config());
    let (wallet, _keys) = new_wallet(&chain, config);
    seed_decoys(&chain, 40);
    fund_standard(&chain, &faucet, 10 * COIN);
    fund_private(&chain, &faucet, &wallet, OutputKind::Anonymous, 1_000_000);
    fund_private(&chain, &faucet, &wallet, OutputKind::Anonymous, 1_000_000);
    mine_empty(&chain, 20);

    let payee = faucet.new_stealth_address(None).unwrap();
    let recipient = Recipient::new(Destination::Stealth(payee), OutputKind::Anonymous, 1_200_000);
    let mut rng = ChaCha20Rng::seed_from_u64(29);
    let built = wallet
        .build_with_rng(&mut rng, &[recipient], InputKind::Anon, &CoinControl::new(), true)
        .unwrap();

    // One signature per input, each over its own split commitment
    assert_eq!(built.tx.inputs.len(), 2);
    let message = built.tx.outputs_hash().unwrap();
    let guard = chain.read().unwrap();
    let mut members = HashSet::new();
    let mut splits = Vec::new();
    for input in &built.tx.inputs {
        let (ring, split, signature) = match input {
            TxIn::Anon {
                ring,
                split_commitment: Some(split),
                signature,
            } => (ring, *split, signature),
            other => panic!("unexpected input {:?}", other),
        };
        assert_eq!(ring.len(), 11);
        members.extend(ring.iter().flatten().copied());
        verify_ring(&*guard, ring, &message.0, signature, &[split]).unwrap();
        splits.push(split);
    }
    drop(guard);
    assert_eq!(members.len(), 22);

    let mut negative: Vec<_> = built
        .tx
        .outputs
        .iter()
        .filter_map(|o| o.commitment().copied())
        .collect();
    negative.push(plain_commitment(built.tx.plain_output_value() + built.fee).unwrap());
    assert!(verify_tally(&splits, &negative).unwrap());
    let record = wallet.get_record(&built.tx.txid().unwrap()).unwrap().unwrap();
    assert!(record.has(flags::ANON_IN));
    assert_eq!(record.inputs.len(), 2);
}
