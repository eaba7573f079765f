// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The buffer (BUF): save/ack/retry/recovery exactly as specified, plus the
//! `tokio` reactor wrapper that runs [`Buffer`]'s synchronous PKV work on a
//! blocking thread while serialising save/ack/timer handlers (§5).
//!
//! [`Buffer`]'s methods are plain, synchronous, and unit-testable on their
//! own — the reactor around them (`run_buffer`) only adds the
//! `spawn_blocking` boundary and the mpsc command queue a daemon needs.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};

use samwise_store::{Pkv, Sibling, StoreError};

use crate::config::BufferConfig;
use crate::error::CoreError;
use crate::metrics::BufMetrics;
use crate::record::BufferRecord;
use crate::stored::StoredPublish;
use samwise_wire::protocol::DistributionPolicy;

/// Resend/threshold tuning, derived from [`BufferConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub tries: i32,
    pub interval_ms: u64,
    pub threshold_ms: u64,
}

impl From<&BufferConfig> for RetryPolicy {
    fn from(config: &BufferConfig) -> Self {
        Self {
            tries: config.retry_count,
            interval_ms: config.retry_interval_ms,
            threshold_ms: config.retry_threshold_ms,
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// A resend the retry pass wants dispatched to the fleet.
#[derive(Debug, Clone)]
pub struct ResendRequest {
    pub new_key: i32,
    pub already_acked_mask: u64,
    pub publish: StoredPublish,
}

/// The durable message buffer.
pub struct Buffer {
    pkv: Pkv,
    policy: RetryPolicy,
    seq: i32,
    last_stored: i32,
    metrics: Arc<BufMetrics>,
}

impl Buffer {
    /// Open (or recover) the buffer at the given store, per §4.3.4: scan
    /// from the highest key downward to seed `seq`/`last_stored`.
    pub fn open(pkv: Pkv, policy: RetryPolicy) -> Result<Self, CoreError> {
        let (seq, last_stored) = Self::recover(&pkv)?;
        tracing::info!(seq, last_stored, "buffer recovered");
        Ok(Self {
            pkv,
            policy,
            seq,
            last_stored,
            metrics: Arc::new(BufMetrics::default()),
        })
    }

    pub fn metrics(&self) -> Arc<BufMetrics> {
        self.metrics.clone()
    }

    fn recover(pkv: &Pkv) -> Result<(i32, i32), CoreError> {
        let mut txn = pkv.begin()?;
        let (highest, bytes) = match txn.last() {
            Ok(found) => found,
            Err(StoreError::NotFound) => {
                txn.abort();
                return Ok((0, 0));
            }
            Err(e) => return Err(e.into()),
        };
        let mut last_stored = 0;
        if matches!(BufferRecord::decode(&bytes)?, BufferRecord::Live { .. }) {
            last_stored = highest;
        } else {
            let mut cursor = highest;
            loop {
                match txn.sibling(Sibling::Prev) {
                    Ok((key, bytes)) => {
                        cursor = key;
                        if matches!(BufferRecord::decode(&bytes)?, BufferRecord::Live { .. }) {
                            last_stored = cursor;
                            break;
                        }
                    }
                    Err(StoreError::NotFound) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        txn.abort();
        Ok((highest, last_stored))
    }

    /// §4.3.1: durably save a publish, returning its assigned key.
    pub fn save(
        &mut self,
        distribution: DistributionPolicy,
        publish: StoredPublish,
    ) -> Result<i32, CoreError> {
        let key = self.seq + 1;
        self.seq = key;
        let n_required = distribution.n_required();

        let mut txn = self.pkv.begin()?;
        match txn.get(key) {
            Err(StoreError::NotFound) => {
                let record = BufferRecord::Live {
                    acks_remaining: n_required,
                    acked_backends: 0,
                    last_sent_ms: now_ms(),
                    tries: self.policy.tries as u32,
                    prev_key: -1,
                    publish,
                };
                txn.put(key, &record.encode())?;
                txn.commit()?;
                self.last_stored = key;
                self.metrics.record_saved();
                Ok(key)
            }
            Ok(bytes) => {
                let existing = BufferRecord::decode(&bytes)?;
                let BufferRecord::AckOnly {
                    acks_remaining,
                    acked_backends,
                } = existing
                else {
                    txn.abort();
                    return Err(CoreError::CorruptRecord(format!(
                        "save raced with a non-AckOnly record at key {key}"
                    )));
                };
                let acks_remaining = (acks_remaining as i32) as i64 + n_required as i64;
                if acks_remaining <= 0 {
                    txn.del()?;
                    txn.commit()?;
                    self.metrics.record_saved();
                    self.metrics.record_acked();
                } else {
                    let record = BufferRecord::Live {
                        acks_remaining: acks_remaining as u32,
                        acked_backends,
                        last_sent_ms: now_ms(),
                        tries: self.policy.tries as u32,
                        prev_key: -1,
                        publish,
                    };
                    txn.update_replace_current(&record.encode())?;
                    txn.commit()?;
                    self.last_stored = key;
                    self.metrics.record_saved();
                }
                Ok(key)
            }
            Err(e) => {
                txn.abort();
                Err(e.into())
            }
        }
    }

    /// §4.3.2: demultiplex a backend confirm.
    pub fn ack(&mut self, backend_id: u64, key: i32) -> Result<(), CoreError> {
        let mut txn = self.pkv.begin()?;
        let mut current_key = key;
        let mut followed_tombstone = false;
        loop {
            match txn.get(current_key) {
                Err(StoreError::NotFound) => {
                    // A dead-ended tombstone chain can never be a racing save: the
                    // key it points at was already materialized as `Live` by the
                    // retry tick that wrote the tombstone, so its absence now means
                    // it was already fully acked and deleted. Commit empty.
                    //
                    // Likewise any key at or below `last_stored` was necessarily
                    // saved at some point (keys only increase); NotFound for one of
                    // those means it was already acked out, not a save racing ahead.
                    if !followed_tombstone && current_key > self.last_stored {
                        let record = BufferRecord::AckOnly {
                            acks_remaining: -1i32 as u32,
                            acked_backends: backend_id,
                        };
                        txn.put(current_key, &record.encode())?;
                    }
                    txn.commit()?;
                    return Ok(());
                }
                Ok(bytes) => {
                    let record = BufferRecord::decode(&bytes)?;
                    match record {
                        BufferRecord::Tombstone { next_key, .. } => {
                            current_key = next_key;
                            followed_tombstone = true;
                            continue;
                        }
                        BufferRecord::AckOnly {
                            acks_remaining,
                            acked_backends,
                        } => {
                            if acked_backends & backend_id != 0 {
                                txn.commit()?;
                                return Ok(());
                            }
                            let next = BufferRecord::AckOnly {
                                acks_remaining: (acks_remaining as i32 - 1) as u32,
                                acked_backends: acked_backends | backend_id,
                            };
                            txn.update_replace_current(&next.encode())?;
                            txn.commit()?;
                            return Ok(());
                        }
                        BufferRecord::Live {
                            acks_remaining,
                            acked_backends,
                            last_sent_ms,
                            tries,
                            prev_key,
                            publish,
                        } => {
                            if acked_backends & backend_id != 0 {
                                txn.commit()?;
                                return Ok(());
                            }
                            let remaining = acks_remaining as i32 - 1;
                            let acked_backends = acked_backends | backend_id;
                            if remaining <= 0 {
                                delete_chain_backward(&mut txn, current_key, prev_key)?;
                                txn.commit()?;
                                self.metrics.record_acked();
                            } else {
                                let next = BufferRecord::Live {
                                    acks_remaining: remaining as u32,
                                    acked_backends,
                                    last_sent_ms,
                                    tries,
                                    prev_key,
                                    publish,
                                };
                                txn.update_replace_current(&next.encode())?;
                                txn.commit()?;
                            }
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    txn.abort();
                    return Err(e.into());
                }
            }
        }
    }

    /// §4.3.3: the periodic resend pass. Returns every message that needs
    /// republishing, for the dispatcher to fan out.
    pub fn retry_tick(&mut self) -> Result<Vec<ResendRequest>, CoreError> {
        let pass_ceiling = self.seq;
        let now = now_ms();
        let mut resends = Vec::new();

        let mut txn = self.pkv.begin()?;
        let mut cursor = match txn.sibling(Sibling::Next) {
            Ok((key, _)) => Some(key),
            Err(StoreError::NotFound) => None,
            Err(e) => {
                txn.abort();
                return Err(e.into());
            }
        };

        while let Some(key) = cursor {
            if key > pass_ceiling {
                break;
            }
            let bytes = txn.get(key)?;
            if let BufferRecord::Live {
                acks_remaining,
                acked_backends,
                last_sent_ms,
                tries,
                prev_key: old_prev,
                publish,
            } = BufferRecord::decode(&bytes)?
            {
                if now - last_sent_ms >= self.policy.threshold_ms as i64 {
                    let remaining_tries = tries.saturating_sub(1);
                    if remaining_tries == 0 {
                        delete_chain_backward(&mut txn, key, old_prev)?;
                        self.metrics.record_retries_exhausted();
                        cursor = advance(&mut txn, key)?;
                        continue;
                    }

                    self.seq += 1;
                    let new_key = self.seq;
                    let new_record = BufferRecord::Live {
                        acks_remaining,
                        acked_backends,
                        last_sent_ms: now,
                        tries: remaining_tries,
                        prev_key: key,
                        publish: publish.clone(),
                    };
                    txn.update_by_key(new_key, &new_record.encode())?;
                    txn.put(
                        key,
                        &BufferRecord::Tombstone {
                            prev_key: old_prev,
                            next_key: new_key,
                        }
                        .encode(),
                    )?;
                    self.metrics.record_resent();
                    resends.push(ResendRequest {
                        new_key,
                        already_acked_mask: acked_backends,
                        publish,
                    });

                    cursor = advance(&mut txn, key)?;
                    continue;
                }
            }
            cursor = advance(&mut txn, key)?;
        }

        txn.commit()?;
        Ok(resends)
    }
}

/// Move the cursor to the sibling of `key` (not of wherever the cursor last
/// landed from a `put`/`update` call), since the retry loop interleaves
/// reads and writes at arbitrary keys.
fn advance(txn: &mut samwise_store::Txn<'_>, key: i32) -> Result<Option<i32>, CoreError> {
    txn.seek(key);
    match txn.sibling(Sibling::Next) {
        Ok((next, _)) => Ok(Some(next)),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn delete_chain_backward(
    txn: &mut samwise_store::Txn<'_>,
    key: i32,
    mut prev_key: i32,
) -> Result<(), CoreError> {
    txn.del_key(key)?;
    while prev_key >= 0 {
        match txn.get(prev_key) {
            Ok(bytes) => match BufferRecord::decode(&bytes)? {
                BufferRecord::Tombstone {
                    prev_key: earlier, ..
                } => {
                    txn.del_key(prev_key)?;
                    prev_key = earlier;
                }
                _ => break,
            },
            Err(StoreError::NotFound) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// The mpsc command set a daemon's front door and the dispatcher send to a
/// running buffer reactor.
pub enum BufCommand {
    Save {
        distribution: DistributionPolicy,
        publish: StoredPublish,
        reply: oneshot::Sender<Result<i32, CoreError>>,
    },
    Ack {
        backend_id: u64,
        key: i32,
    },
}

/// Run `buffer` as a reactor task: commands are handled one at a time (each
/// wrapped in `spawn_blocking` so the LMDB commit never stalls the runtime),
/// and a retry tick fires every `interval_ms`.
pub async fn run_buffer(
    mut buffer: Buffer,
    mut commands: mpsc::Receiver<BufCommand>,
    resend_out: mpsc::Sender<ResendRequest>,
) {
    let interval_ms = buffer.policy.interval_ms.max(1);
    let mut retry_timer = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    retry_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { return };
                buffer = handle_command(buffer, command).await;
            }
            _ = retry_timer.tick() => {
                let (next_buffer, resends) = tokio::task::spawn_blocking(move || {
                    let resends = buffer.retry_tick();
                    (buffer, resends)
                })
                .await
                .expect("buffer retry task panicked");
                buffer = next_buffer;
                match resends {
                    Ok(resends) => {
                        for resend in resends {
                            if resend_out.send(resend).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) if err.is_fatal() => {
                        tracing::error!(error = %err, "fatal buffer error during retry tick");
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "buffer retry tick failed");
                    }
                }
            }
        }
    }
}

async fn handle_command(buffer: Buffer, command: BufCommand) -> Buffer {
    match command {
        BufCommand::Save {
            distribution,
            publish,
            reply,
        } => {
            let (buffer, result) = tokio::task::spawn_blocking(move || {
                let mut buffer = buffer;
                let result = buffer.save(distribution, publish);
                (buffer, result)
            })
            .await
            .expect("buffer save task panicked");
            let _ = reply.send(result);
            buffer
        }
        BufCommand::Ack { backend_id, key } => {
            let (buffer, result) = tokio::task::spawn_blocking(move || {
                let mut buffer = buffer;
                let result = buffer.ack(backend_id, key);
                (buffer, result)
            })
            .await
            .expect("buffer ack task panicked");
            if let Err(err) = result {
                tracing::warn!(error = %err, key, "ack handling failed");
            }
            buffer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use samwise_store::PkvOptions;
    use samwise_wire::protocol::PublishProperties;
    use tempfile::tempdir;

    fn open_buffer(tries: i32) -> Buffer {
        let dir = tempdir().unwrap();
        let pkv = Pkv::open(dir.path(), "data", PkvOptions::default()).unwrap();
        Buffer::open(
            pkv,
            RetryPolicy {
                tries,
                interval_ms: 1_000,
                threshold_ms: 0,
            },
        )
        .unwrap()
    }

    fn sample_publish() -> StoredPublish {
        StoredPublish {
            exchange: "ex".into(),
            routing_key: "rk".into(),
            mandatory: false,
            immediate: false,
            properties: PublishProperties::default(),
            headers: vec![],
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn save_round_robin_creates_live_record_with_one_required_ack() {
        let mut buf = open_buffer(3);
        let key = buf
            .save(DistributionPolicy::RoundRobin, sample_publish())
            .unwrap();
        assert_eq!(key, 1);

        let mut txn = buf.pkv.begin().unwrap();
        let bytes = txn.get(key).unwrap();
        match BufferRecord::decode(&bytes).unwrap() {
            BufferRecord::Live { acks_remaining, .. } => assert_eq!(acks_remaining, 1),
            other => panic!("expected live, got {other:?}"),
        }
    }

    #[test]
    fn ack_deletes_round_robin_record_after_one_confirm() {
        let mut buf = open_buffer(3);
        let key = buf
            .save(DistributionPolicy::RoundRobin, sample_publish())
            .unwrap();
        buf.ack(0b1, key).unwrap();

        let mut txn = buf.pkv.begin().unwrap();
        assert!(matches!(txn.get(key), Err(StoreError::NotFound)));
    }

    #[test]
    fn ack_requires_n_distinct_backends_for_redundant_policy() {
        let mut buf = open_buffer(3);
        let key = buf
            .save(DistributionPolicy::Redundant(2), sample_publish())
            .unwrap();
        buf.ack(0b1, key).unwrap();

        let mut txn = buf.pkv.begin().unwrap();
        let bytes = txn.get(key).unwrap();
        match BufferRecord::decode(&bytes).unwrap() {
            BufferRecord::Live { acks_remaining, .. } => assert_eq!(acks_remaining, 1),
            other => panic!("expected live, got {other:?}"),
        }
        drop(txn);

        buf.ack(0b10, key).unwrap();
        let mut txn = buf.pkv.begin().unwrap();
        assert!(matches!(txn.get(key), Err(StoreError::NotFound)));
    }

    #[test]
    fn duplicate_ack_from_same_backend_is_ignored() {
        let mut buf = open_buffer(3);
        let key = buf
            .save(DistributionPolicy::Redundant(2), sample_publish())
            .unwrap();
        buf.ack(0b1, key).unwrap();
        buf.ack(0b1, key).unwrap();

        let mut txn = buf.pkv.begin().unwrap();
        let bytes = txn.get(key).unwrap();
        match BufferRecord::decode(&bytes).unwrap() {
            BufferRecord::Live { acks_remaining, .. } => assert_eq!(acks_remaining, 1),
            other => panic!("expected live, got {other:?}"),
        }
    }

    #[test]
    fn early_ack_creates_negative_ack_only_then_save_resolves_it() {
        let mut buf = open_buffer(3);
        // An ack arrives for a key that hasn't been saved yet.
        buf.ack(0b1, 1).unwrap();

        let mut txn = buf.pkv.begin().unwrap();
        let bytes = txn.get(1).unwrap();
        match BufferRecord::decode(&bytes).unwrap() {
            BufferRecord::AckOnly { acks_remaining, .. } => {
                assert_eq!(acks_remaining as i32, -1)
            }
            other => panic!("expected ack_only, got {other:?}"),
        }
        drop(txn);

        let key = buf
            .save(DistributionPolicy::RoundRobin, sample_publish())
            .unwrap();
        assert_eq!(key, 1);

        let mut txn = buf.pkv.begin().unwrap();
        assert!(matches!(txn.get(1), Err(StoreError::NotFound)));
    }

    #[test]
    fn retry_tick_resends_after_threshold_and_tombstones_the_old_key() {
        let mut buf = open_buffer(3);
        let key = buf
            .save(DistributionPolicy::RoundRobin, sample_publish())
            .unwrap();

        let resends = buf.retry_tick().unwrap();
        assert_eq!(resends.len(), 1);
        let new_key = resends[0].new_key;
        assert!(new_key > key);

        let mut txn = buf.pkv.begin().unwrap();
        let bytes = txn.get(key).unwrap();
        match BufferRecord::decode(&bytes).unwrap() {
            BufferRecord::Tombstone {
                next_key,
                prev_key: tomb_prev,
            } => {
                assert_eq!(next_key, new_key);
                assert_eq!(tomb_prev, -1);
            }
            other => panic!("expected tombstone, got {other:?}"),
        }

        let bytes = txn.get(new_key).unwrap();
        match BufferRecord::decode(&bytes).unwrap() {
            BufferRecord::Live { prev_key, .. } => assert_eq!(prev_key, key),
            other => panic!("expected live, got {other:?}"),
        }
    }

    #[test]
    fn late_ack_under_tombstoned_key_resolves_the_live_record_at_new_key() {
        let mut buf = open_buffer(3);
        let key = buf
            .save(DistributionPolicy::RoundRobin, sample_publish())
            .unwrap();
        let resends = buf.retry_tick().unwrap();
        let new_key = resends[0].new_key;

        buf.ack(0b1, key).unwrap();

        let mut txn = buf.pkv.begin().unwrap();
        assert!(matches!(txn.get(key), Err(StoreError::NotFound)));
        assert!(matches!(txn.get(new_key), Err(StoreError::NotFound)));
    }

    #[test]
    fn duplicate_ack_after_retry_chain_fully_resolved_is_a_silent_no_op() {
        let mut buf = open_buffer(5);
        let key = buf
            .save(DistributionPolicy::RoundRobin, sample_publish())
            .unwrap();
        let resends1 = buf.retry_tick().unwrap();
        let second_key = resends1[0].new_key;
        let resends2 = buf.retry_tick().unwrap();
        let third_key = resends2[0].new_key;

        // One confirm fully resolves the whole tombstone chain.
        buf.ack(0b1, third_key).unwrap();
        let mut txn = buf.pkv.begin().unwrap();
        assert!(matches!(txn.get(key), Err(StoreError::NotFound)));
        assert!(matches!(txn.get(second_key), Err(StoreError::NotFound)));
        assert!(matches!(txn.get(third_key), Err(StoreError::NotFound)));
        drop(txn);

        // A duplicate ack against the *original* key, with no saves in
        // between, must not fabricate a phantom AckOnly record: it would
        // never be resolved by a future save since `key` was already used.
        buf.ack(0b1, key).unwrap();
        let mut txn = buf.pkv.begin().unwrap();
        assert!(matches!(txn.get(key), Err(StoreError::NotFound)));
    }

    #[test]
    fn retry_exhaustion_discards_the_message_without_client_notification() {
        let mut buf = open_buffer(1);
        let key = buf
            .save(DistributionPolicy::RoundRobin, sample_publish())
            .unwrap();

        let resends = buf.retry_tick().unwrap();
        assert!(resends.is_empty());

        let mut txn = buf.pkv.begin().unwrap();
        assert!(matches!(txn.get(key), Err(StoreError::NotFound)));
    }

    #[test]
    fn recovery_after_reopen_seeds_seq_and_last_stored_from_highest_live_key() {
        let dir = tempdir().unwrap();
        let key = {
            let pkv = Pkv::open(dir.path(), "data", PkvOptions::default()).unwrap();
            let mut buf = Buffer::open(
                pkv,
                RetryPolicy {
                    tries: 3,
                    interval_ms: 1_000,
                    threshold_ms: 0,
                },
            )
            .unwrap();
            buf.save(DistributionPolicy::RoundRobin, sample_publish())
                .unwrap()
        };

        let pkv = Pkv::open(dir.path(), "data", PkvOptions::default()).unwrap();
        let mut buf = Buffer::open(
            pkv,
            RetryPolicy {
                tries: 3,
                interval_ms: 1_000,
                threshold_ms: 0,
            },
        )
        .unwrap();
        assert_eq!(buf.seq, key);
        assert_eq!(buf.last_stored, key);

        let next_key = buf
            .save(DistributionPolicy::RoundRobin, sample_publish())
            .unwrap();
        assert_eq!(next_key, key + 1);
    }
}
