//! Event normalizer: raw provider logs to `CanonicalEvent`
//!
//! Dispatch is by `EventKind`, one decoding function per kind. Nothing in
//! here panics or errors: a log that does not decode is logged at `warn`
//! and skipped.

use super::abi::{self, Words};
use super::types::{
    Address, CanonicalEvent, EventKind, EventPayload, RawLog, StrategyMultiplier, StrategyShares,
};

/// Normalize one raw log against the schema of `kind`.
///
/// Returns `None` when the log should not be materialized: wrong topic0,
/// reorged (`removed`), or any malformed/missing field.
pub fn normalize(raw: &RawLog, kind: EventKind) -> Option<CanonicalEvent> {
    if raw.removed {
        log::debug!("Skipping removed log {:?}/{:?}", raw.transaction_hash, raw.log_index);
        return None;
    }

    let event = decode_envelope(raw, kind);
    if event.is_none() {
        log::warn!(
            "⚠️  Skipping malformed {} log (tx={:?}, log_index={:?})",
            kind.as_str(),
            raw.transaction_hash,
            raw.log_index
        );
    }
    event
}

/// Normalize a batch, dropping whatever fails to decode.
pub fn normalize_all(raws: &[RawLog], kind: EventKind) -> Vec<CanonicalEvent> {
    raws.iter().filter_map(|raw| normalize(raw, kind)).collect()
}

fn decode_envelope(raw: &RawLog, kind: EventKind) -> Option<CanonicalEvent> {
    let topic0 = raw.topics.first()?;
    if !topic0.eq_ignore_ascii_case(kind.topic0()) {
        return None;
    }

    let address = Address::parse(raw.address.as_deref()?)?;
    let tx_hash = abi::topic_bytes32(raw.transaction_hash.as_deref()?)?;
    let data = abi::decode_hex(raw.data.as_deref().unwrap_or("0x"))?;
    let words = Words::new(&data);
    let topics = &raw.topics[1..];

    let payload = match kind {
        EventKind::OperatorRegistered => operator_registered(topics, words),
        EventKind::OperatorMetadataUriUpdated => operator_metadata_uri(topics, words),
        EventKind::AvsMetadataUriUpdated => avs_metadata_uri(topics, words),
        EventKind::OperatorAvsRegistrationStatusUpdated => avs_registration(topics, words),
        EventKind::StrategyAddedToDepositWhitelist => strategy_whitelisted(words),
        EventKind::PodDeployed => pod_deployed(topics),
        EventKind::Deposit => deposit(words),
        EventKind::StakerDelegated => staker_delegation(topics, true),
        EventKind::StakerUndelegated => staker_delegation(topics, false),
        EventKind::OperatorSharesIncreased => operator_shares(topics, words, true),
        EventKind::OperatorSharesDecreased => operator_shares(topics, words, false),
        EventKind::WithdrawalQueued => withdrawal_queued(words),
        EventKind::WithdrawalCompleted => withdrawal_completed(words),
        EventKind::AllocationUpdated => allocation_updated(words),
        EventKind::EncumberedMagnitudeUpdated => encumbered_magnitude(words),
        EventKind::AvsRewardsSubmissionCreated => rewards_submission(topics, words),
    }?;

    Some(CanonicalEvent {
        address,
        tx_hash,
        tx_index: raw.transaction_index?,
        log_index: raw.log_index?,
        block_number: raw.block_number?,
        block_time: raw.block_time?,
        payload,
    })
}

fn operator_registered(topics: &[String], words: Words) -> Option<EventPayload> {
    Some(EventPayload::OperatorRegistered {
        operator: abi::topic_address(topics.first()?)?,
        delegation_approver: words.address(0)?,
    })
}

fn operator_metadata_uri(topics: &[String], words: Words) -> Option<EventPayload> {
    Some(EventPayload::OperatorMetadataUriUpdated {
        operator: abi::topic_address(topics.first()?)?,
        metadata_uri: words.string(0)?,
    })
}

fn avs_metadata_uri(topics: &[String], words: Words) -> Option<EventPayload> {
    Some(EventPayload::AvsMetadataUriUpdated {
        avs: abi::topic_address(topics.first()?)?,
        metadata_uri: words.string(0)?,
    })
}

fn avs_registration(topics: &[String], words: Words) -> Option<EventPayload> {
    // status enum: 0 = UNREGISTERED, 1 = REGISTERED
    let registered = match words.u8(0)? {
        0 => false,
        1 => true,
        _ => return None,
    };
    Some(EventPayload::OperatorAvsRegistrationStatusUpdated {
        operator: abi::topic_address(topics.first()?)?,
        avs: abi::topic_address(topics.get(1)?)?,
        registered,
    })
}

fn strategy_whitelisted(words: Words) -> Option<EventPayload> {
    Some(EventPayload::StrategyAddedToDepositWhitelist {
        strategy: words.address(0)?,
    })
}

fn pod_deployed(topics: &[String]) -> Option<EventPayload> {
    Some(EventPayload::PodDeployed {
        pod: abi::topic_address(topics.first()?)?,
        owner: abi::topic_address(topics.get(1)?)?,
    })
}

fn deposit(words: Words) -> Option<EventPayload> {
    Some(EventPayload::Deposit {
        staker: words.address(0)?,
        token: words.address(1)?,
        strategy: words.address(2)?,
        shares: words.uint(3)?,
    })
}

fn staker_delegation(topics: &[String], delegated: bool) -> Option<EventPayload> {
    let staker = abi::topic_address(topics.first()?)?;
    let operator = abi::topic_address(topics.get(1)?)?;
    Some(if delegated {
        EventPayload::StakerDelegated { staker, operator }
    } else {
        EventPayload::StakerUndelegated { staker, operator }
    })
}

fn operator_shares(topics: &[String], words: Words, increased: bool) -> Option<EventPayload> {
    let operator = abi::topic_address(topics.first()?)?;
    let staker = words.address(0)?;
    let strategy = words.address(1)?;
    let shares = words.uint(2)?;
    Some(if increased {
        EventPayload::OperatorSharesIncreased { operator, staker, strategy, shares }
    } else {
        EventPayload::OperatorSharesDecreased { operator, staker, strategy, shares }
    })
}

fn withdrawal_queued(words: Words) -> Option<EventPayload> {
    let withdrawal_root = words.bytes32(0)?;
    let w = words.tuple(1)?;
    let strategies = w.address_array(5)?;
    let shares = w.uint_array(6)?;
    if strategies.len() != shares.len() {
        return None;
    }
    Some(EventPayload::WithdrawalQueued {
        withdrawal_root,
        staker: w.address(0)?,
        delegated_to: w.address(1)?,
        withdrawer: w.address(2)?,
        nonce: w.uint(3)?,
        start_block: w.u64(4)?,
        strategies: strategies
            .into_iter()
            .zip(shares)
            .map(|(strategy, shares)| StrategyShares { strategy, shares })
            .collect(),
    })
}

fn withdrawal_completed(words: Words) -> Option<EventPayload> {
    Some(EventPayload::WithdrawalCompleted {
        withdrawal_root: words.bytes32(0)?,
    })
}

fn allocation_updated(words: Words) -> Option<EventPayload> {
    Some(EventPayload::AllocationUpdated {
        operator: words.address(0)?,
        avs: words.address(1)?,
        operator_set_id: words.u32(2)?,
        strategy: words.address(3)?,
        magnitude: words.u64(4)?,
        effect_block: u64::from(words.u32(5)?),
    })
}

fn encumbered_magnitude(words: Words) -> Option<EventPayload> {
    Some(EventPayload::EncumberedMagnitudeUpdated {
        operator: words.address(0)?,
        strategy: words.address(1)?,
        encumbered_magnitude: words.u64(2)?,
    })
}

fn rewards_submission(topics: &[String], words: Words) -> Option<EventPayload> {
    let submission = words.tuple(0)?;
    let strategies = submission
        .tuple_array(0, 2)?
        .into_iter()
        .map(|pair| {
            Some(StrategyMultiplier {
                strategy: pair.address(0)?,
                multiplier: pair.uint(1)?,
            })
        })
        .collect::<Option<Vec<_>>>()?;

    Some(EventPayload::AvsRewardsSubmissionCreated {
        avs: abi::topic_address(topics.first()?)?,
        submission_nonce: abi::topic_uint(topics.get(1)?)?,
        submission_hash: abi::topic_bytes32(topics.get(2)?)?,
        strategies,
        token: submission.address(1)?,
        amount: submission.uint(2)?,
        start_timestamp: submission.u64(3)?,
        duration: submission.u32(4)?,
    })
}
