// src/core/reconcile.rs
use crate::connectors::traits::Broker;
use crate::storage::StateStore;
use crate::types::{CarrySide, PositionRecord, PositionState};
use std::cmp::Ordering;
use tracing::{info, warn};

/// Deterministic choice when the exchange reports several open perps:
/// the persisted coin if present, else the largest notional, ties by coin name.
pub fn pick_position<'a>(records: &'a [PositionRecord], persisted_coin: Option<&str>) -> Option<&'a PositionRecord> {
    if let Some(coin) = persisted_coin {
        if let Some(rec) = records.iter().find(|r| r.coin.eq_ignore_ascii_case(coin)) {
            return Some(rec);
        }
    }
    records.iter().min_by(|a, b| match b.notional().cmp(&a.notional()) {
        Ordering::Equal => a.coin.cmp(&b.coin),
        other => other,
    })
}

/// Exchange record -> local state. Entry metadata survives only when coin and side agree.
fn adopt(rec: &PositionRecord, side: CarrySide, local: Option<&PositionState>, now_ms: i64) -> PositionState {
    let keep = local.filter(|l| l.coin.eq_ignore_ascii_case(&rec.coin) && l.side == side);
    PositionState {
        coin: rec.coin.clone(),
        side,
        is_open: true,
        opened_at_ms: keep.map_or(now_ms, |l| l.opened_at_ms),
        entry_premium: keep.map_or(0.0, |l| l.entry_premium),
        entry_funding: keep.map_or(0.0, |l| l.entry_funding),
        size: Some(rec.signed_size.abs()),
        entry_px: rec.entry_price.or_else(|| keep.and_then(|l| l.entry_px)),
    }
}

/// Replaces local state with what the exchange reports. A failed query keeps `local`.
pub async fn reconcile(
    broker: &dyn Broker,
    store: &StateStore,
    local: Option<PositionState>,
    now_ms: i64,
) -> Option<PositionState> {
    let records = match broker.get_positions(None).await {
        Ok(r) => r,
        Err(e) => {
            warn!("RECONCILE skipped, exchange query failed; keeping local state | err={}", e);
            return local;
        }
    };
    let records: Vec<PositionRecord> = records.into_iter().filter(|r| !r.signed_size.is_zero()).collect();
    let local_open = local.as_ref().filter(|l| l.is_open);

    let chosen = match records.len() {
        0 => {
            if let Some(l) = local_open {
                warn!("RECONCILE | exchange flat but local says {} {} -> clearing", l.coin, l.side);
            } else {
                info!("RECONCILE | exchange flat, local flat");
            }
            store.save(None).await;
            return None;
        }
        1 => &records[0],
        n => {
            let coins: Vec<&str> = records.iter().map(|r| r.coin.as_str()).collect();
            let pick = match pick_position(&records, local_open.map(|l| l.coin.as_str())) {
                Some(p) => p,
                None => return local,
            };
            warn!(
                "RECONCILE | {} open perps on exchange {:?}; tracking {} only",
                n, coins, pick.coin
            );
            pick
        }
    };

    let Some(side) = CarrySide::from_perp_size(chosen.signed_size) else {
        return local;
    };
    let adopted = adopt(chosen, side, local_open, now_ms);

    match local_open {
        Some(l) if l.coin.eq_ignore_ascii_case(&adopted.coin) && l.side == adopted.side => {
            info!("RECONCILE | local agrees with exchange | {} {} szi={}", adopted.coin, adopted.side, chosen.signed_size)
        }
        Some(l) => warn!(
            "RECONCILE | local {} {} disagrees with exchange {} {} -> using exchange",
            l.coin, l.side, adopted.coin, adopted.side
        ),
        None => warn!(
            "RECONCILE | local flat but exchange holds {} {} szi={} -> adopting",
            adopted.coin, adopted.side, chosen.signed_size
        ),
    }

    store.save(Some(&adopted)).await;
    Some(adopted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperConfig;
    use crate::connectors::paper::PaperBroker;
    use crate::error::ConnectorError;
    use crate::types::{PerpOrderRequest, Side, Snapshot};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn rec(coin: &str, szi: Decimal, px: Decimal) -> PositionRecord {
        PositionRecord {
            coin: coin.to_string(),
            signed_size: szi,
            entry_price: Some(px),
            unrealized_pnl: None,
        }
    }

    fn local(coin: &str, side: CarrySide) -> PositionState {
        let snap = Snapshot::new(coin, Some(0.00002), Some(0.0005), 42);
        PositionState::opened(&snap, side)
    }

    fn broker() -> PaperBroker {
        PaperBroker::with_fixed_mids(
            &PaperConfig::default(),
            "USDC",
            &[("ETH", dec!(2000)), ("BTC", dec!(50000)), ("SOL", dec!(100))],
        )
    }

    #[test]
    fn pick_prefers_persisted_then_notional_then_name() {
        let records = vec![
            rec("SOL", dec!(-1), dec!(100)),
            rec("ETH", dec!(-0.05), dec!(2000)),
            rec("BTC", dec!(0.002), dec!(50000)),
        ];
        assert_eq!(pick_position(&records, Some("SOL")).unwrap().coin, "SOL");
        // ETH and SOL both 100 notional, BTC is 100 too: name breaks the tie
        assert_eq!(pick_position(&records, None).unwrap().coin, "BTC");
        assert_eq!(pick_position(&records, Some("DOGE")).unwrap().coin, "BTC");

        let records = vec![rec("SOL", dec!(-1), dec!(100)), rec("ETH", dec!(-1), dec!(2000))];
        assert_eq!(pick_position(&records, None).unwrap().coin, "ETH");
        assert!(pick_position(&[], None).is_none());
    }

    #[tokio::test]
    async fn exchange_flat_clears_local_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let stale = local("ETH", CarrySide::ShortPerpLongSpot);
        store.save(Some(&stale)).await;

        let out = reconcile(&broker(), &store, Some(stale), 1_000).await;
        assert_eq!(out, None);
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"position": null}));
    }

    #[tokio::test]
    async fn single_exchange_position_overwrites_local() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let b = broker();
        b.seed_perp("BTC", dec!(0.002), dec!(50000));

        let out = reconcile(&b, &store, Some(local("ETH", CarrySide::ShortPerpLongSpot)), 9_000)
            .await
            .unwrap();
        assert_eq!(out.coin, "BTC");
        assert_eq!(out.side, CarrySide::LongPerpShortSpot);
        assert_eq!(out.opened_at_ms, 9_000);
        assert_eq!(out.size, Some(dec!(0.002)));
        assert_eq!(store.load().await, Some(out));
    }

    #[tokio::test]
    async fn agreeing_local_keeps_entry_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let b = broker();
        b.place_perp_order(&PerpOrderRequest {
            coin: "ETH".into(),
            side: Side::Sell,
            notional: dec!(100),
            reduce_only: false,
            size: None,
        })
        .await
        .unwrap();

        let out = reconcile(&b, &store, Some(local("ETH", CarrySide::ShortPerpLongSpot)), 9_000)
            .await
            .unwrap();
        assert_eq!(out.opened_at_ms, 42);
        assert_eq!(out.entry_premium, 0.0005);
        assert_eq!(out.entry_px, Some(dec!(2000)));
    }

    #[tokio::test]
    async fn several_positions_pick_persisted_coin() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let b = broker();
        b.seed_perp("ETH", dec!(-0.05), dec!(2000));
        b.seed_perp("SOL", dec!(-10), dec!(100));

        let out = reconcile(&b, &store, Some(local("ETH", CarrySide::ShortPerpLongSpot)), 1)
            .await
            .unwrap();
        assert_eq!(out.coin, "ETH");

        let out = reconcile(&b, &store, None, 1).await.unwrap();
        assert_eq!(out.coin, "SOL");
    }

    struct Down;

    #[async_trait::async_trait]
    impl Broker for Down {
        async fn get_positions(&self, _coin: Option<&str>) -> Result<Vec<PositionRecord>, ConnectorError> {
            Err(ConnectorError::Timeout)
        }
        async fn get_spot_balances(&self) -> Result<std::collections::HashMap<String, Decimal>, ConnectorError> {
            Err(ConnectorError::Timeout)
        }
        async fn place_perp_order(
            &self,
            _req: &PerpOrderRequest,
        ) -> Result<crate::types::OrderResult, ConnectorError> {
            Err(ConnectorError::Timeout)
        }
        async fn place_spot_order(
            &self,
            _req: &crate::types::SpotOrderRequest,
        ) -> Result<crate::types::SpotOrderResult, ConnectorError> {
            Err(ConnectorError::Timeout)
        }
        async fn can_trade_spot_pair(&self, _base: &str, _quote: &str) -> Result<bool, ConnectorError> {
            Err(ConnectorError::Timeout)
        }
        async fn spot_borrow_enabled(&self, _base: &str) -> Result<bool, ConnectorError> {
            Err(ConnectorError::Timeout)
        }
    }

    #[tokio::test]
    async fn failed_query_leaves_local_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mine = local("ETH", CarrySide::ShortPerpLongSpot);
        let out = reconcile(&Down, &store, Some(mine.clone()), 1).await;
        assert_eq!(out, Some(mine));
        assert!(!store.path().exists());
    }
}
