use tracing::{info, warn};

use super::{Game, GameError};
use crate::Crystals;
use crate::model::{AccountId, Resolution, Round, RoundId, TransactionKind, TxRef};
use crate::store::StoreError;

/// Summary of one completed settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// The round as it was marked settled.
    pub round: Round,
    /// The round opened right after.
    pub next: Round,
    pub won: usize,
    pub lost: usize,
    /// Sum of all rewards of the round.
    pub paid: Crystals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    /// There was nothing to settle; a fresh round was opened instead.
    Opened(Round),
    Settled(Settlement),
    /// Someone else settled the round first.
    AlreadySettled(RoundId),
}

impl Game {
    /// Settle whatever round is open and open the next one. With no open
    /// round this only makes sure one exists.
    pub fn settle_open_round(&self) -> Result<SettleOutcome, GameError> {
        match self.store.open_round() {
            Some(round) => self.settle_round(round.id),
            None => self.ensure_open_round().map(SettleOutcome::Opened),
        }
    }

    /// Resolve every bet of `id`, mark it settled and open the next round.
    ///
    /// Safe to call again after a failure: bets that were already resolved
    /// are left alone, so no bet is ever paid twice. Concurrent calls for the
    /// same round produce exactly one [`SettleOutcome::Settled`].
    pub fn settle_round(&self, id: RoundId) -> Result<SettleOutcome, GameError> {
        let round = match self.store.seal_round(id) {
            Ok(round) => round,
            Err(StoreError::RoundNotOpen(id)) => return Ok(SettleOutcome::AlreadySettled(id)),
            Err(err) => return Err(err.into()),
        };

        // sealed: this snapshot is every bet the round will ever have
        for bet in self.store.bets_for_round(id) {
            self.resolve_bet(&round, &bet.account).inspect_err(|e| {
                warn!(round = id, bet = bet.id, reason = %e, "settlement interrupted");
            })?;
        }

        let settled = match self.store.mark_settled(id, self.clock.now()) {
            Ok(round) => round,
            Err(StoreError::RoundNotOpen(id)) => return Ok(SettleOutcome::AlreadySettled(id)),
            Err(err) => return Err(err.into()),
        };

        let (mut won, mut lost, mut paid) = (0, 0, Crystals::ZERO);
        for bet in self.store.bets_for_round(id) {
            match bet.resolution {
                Resolution::Won => won += 1,
                Resolution::Lost => lost += 1,
                Resolution::Pending => {}
            }
            paid = paid.saturating_add(bet.reward);
        }
        info!(
            round = id,
            winning = %round.winning,
            won,
            lost,
            paid = %paid,
            "round settled"
        );

        let next = self.open_round_with(self.draw_mountain())?;
        Ok(SettleOutcome::Settled(Settlement {
            round: settled,
            next,
            won,
            lost,
            paid,
        }))
    }
}

/// Private API
impl Game {
    /// Resolve one bet against the winning mountain. The ledger entry is
    /// written while the bet is locked, so the bet only leaves `pending` if
    /// its payout or forfeit was recorded.
    fn resolve_bet(&self, round: &Round, account: &AccountId) -> Result<(), GameError> {
        let now = self.clock.now();
        self.store.update_bet(round.id, account, |bet| {
            if !bet.is_pending() {
                return Ok(());
            }

            let reference = TxRef::bet(round.id, bet.id);
            if bet.mountain == round.winning {
                let reward = bet.amount.doubled().ok_or_else(|| {
                    GameError::Storage(format!("reward for bet {} overflows", bet.id))
                })?;
                self.ledger
                    .credit(account, reward, TransactionKind::Payout, reference)?;
                bet.resolution = Resolution::Won;
                bet.reward = reward;
            } else {
                self.ledger.record_forfeit(account, bet.amount, reference)?;
                bet.resolution = Resolution::Lost;
                bet.reward = Crystals::ZERO;
            }
            bet.updated_at = now;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::BetRequest;
    use crate::game::tests::game;
    use crate::model::{Mountain, PageRequest, RoundStatus};
    use crate::{GameConfig, ManualClock};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn stake(game: &Game, account: &str, round: RoundId, mountain: Option<&str>, amount: Option<i64>) {
        game.place_or_amend_bet(
            &account.into(),
            BetRequest {
                round: Some(round),
                mountain: mountain.map(str::to_string),
                amount,
            },
        )
        .unwrap();
    }

    fn payouts(game: &Game, account: &str) -> usize {
        game.transactions(&account.into(), Default::default())
            .items
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Payout)
            .count()
    }

    #[test]
    fn amended_bet_wins_on_final_mountain() {
        let (game, _) = game();
        let alice = AccountId::from("alice");
        assert_eq!(game.balance(&alice).unwrap(), Crystals::new(100));

        let round = game.open_round_with(Mountain::WhiteTiger).unwrap();
        stake(&game, "alice", round.id, Some("azure-dragon"), Some(30));
        assert_eq!(game.balance(&alice).unwrap(), Crystals::new(70));
        stake(&game, "alice", round.id, Some("white-tiger"), Some(20));
        assert_eq!(game.balance(&alice).unwrap(), Crystals::new(50));

        let SettleOutcome::Settled(settlement) = game.settle_open_round().unwrap() else {
            panic!("round should have settled");
        };

        let bet = game.store.bet(round.id, &alice).unwrap();
        assert_eq!(bet.resolution, Resolution::Won);
        assert_eq!(bet.amount, Crystals::new(50));
        assert_eq!(bet.reward, Crystals::new(100));
        assert_eq!(game.balance(&alice).unwrap(), Crystals::new(150));

        assert_eq!(settlement.round.status, RoundStatus::Settled);
        assert_eq!(settlement.round.revealed(), Some(Mountain::WhiteTiger));
        assert_eq!((settlement.won, settlement.lost), (1, 0));
        assert_eq!(settlement.paid, Crystals::new(100));
        assert_eq!(settlement.next.id, 2);
        assert!(settlement.next.is_open());
    }

    #[test]
    fn losing_bet_is_forfeited() {
        let (game, _) = game();
        let round = game.open_round_with(Mountain::AzureDragon).unwrap();
        stake(&game, "bob", round.id, Some("white-tiger"), Some(40));

        game.settle_round(round.id).unwrap();

        let bet = game.store.bet(round.id, &"bob".into()).unwrap();
        assert_eq!(bet.resolution, Resolution::Lost);
        assert_eq!(bet.reward, Crystals::ZERO);
        assert_eq!(game.balance(&"bob".into()).unwrap(), Crystals::new(60));

        let latest = &game.transactions(&"bob".into(), Default::default()).items[0];
        assert_eq!(latest.kind, TransactionKind::Forfeit);
        assert_eq!(latest.delta, -40);
        assert_eq!(latest.reference, TxRef::bet(round.id, bet.id));
    }

    #[test]
    fn settling_without_open_round_opens_one() {
        let (game, _) = game();
        let outcome = game.settle_open_round().unwrap();
        assert!(matches!(outcome, SettleOutcome::Opened(round) if round.id == 1));
        assert!(game.store.round(1).unwrap().is_open());
    }

    #[test]
    fn settled_round_is_a_no_op() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        game.settle_round(round.id).unwrap();

        assert_eq!(
            game.settle_round(round.id).unwrap(),
            SettleOutcome::AlreadySettled(round.id)
        );
        assert_eq!(game.store.rounds().len(), 2);
    }

    #[test]
    fn settled_rounds_have_no_pending_bets() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        for (account, mountain) in [("a", "azure-dragon"), ("b", "white-tiger"), ("c", "azure-dragon")] {
            stake(&game, account, round.id, Some(mountain), Some(10));
        }

        game.settle_round(round.id).unwrap();

        for bet in game.store.bets_for_round(round.id) {
            assert!(!bet.is_pending());
            match bet.resolution {
                Resolution::Won => assert_eq!(bet.reward, Crystals::new(20)),
                Resolution::Lost => assert_eq!(bet.reward, Crystals::ZERO),
                Resolution::Pending => unreachable!(),
            }
        }
    }

    #[test]
    fn interrupted_settlement_resumes_without_double_payout() {
        let (game, _) = game();
        let round = game.open_round_with(Mountain::WhiteTiger).unwrap();
        stake(&game, "alice", round.id, Some("white-tiger"), Some(30));
        stake(&game, "bob", round.id, Some("azure-dragon"), Some(30));

        // seal, alice's bet, alice's payout, then faults
        game.store.fail_after(3);
        let err = game.settle_round(round.id).unwrap_err();
        assert!(!err.is_recoverable());

        let stored = game.store.round(round.id).unwrap();
        assert!(stored.is_open());
        assert_eq!(game.store.bet(round.id, &"alice".into()).unwrap().resolution, Resolution::Won);
        assert!(game.store.bet(round.id, &"bob".into()).unwrap().is_pending());

        game.store.heal();
        let SettleOutcome::Settled(settlement) = game.settle_round(round.id).unwrap() else {
            panic!("retry should settle");
        };

        assert_eq!((settlement.won, settlement.lost), (1, 1));
        assert_eq!(payouts(&game, "alice"), 1);
        assert_eq!(game.balance(&"alice".into()).unwrap(), Crystals::new(130));
        assert_eq!(game.balance(&"bob".into()).unwrap(), Crystals::new(70));
    }

    #[test]
    fn racing_settlements_open_one_next_round() {
        let (game, _) = game();
        let game = Arc::new(game);
        let round = game.ensure_open_round().unwrap();
        for account in ["a", "b", "c", "d"] {
            stake(&game, account, round.id, Some("azure-dragon"), Some(25));
        }

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let game = Arc::clone(&game);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    game.settle_round(round.id).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let settled = outcomes
            .iter()
            .filter(|o| matches!(o, SettleOutcome::Settled(_)))
            .count();
        assert_eq!(settled, 1);
        assert!(outcomes.contains(&SettleOutcome::AlreadySettled(round.id)));
        assert_eq!(game.store.rounds().len(), 2);
        for account in ["a", "b", "c", "d"] {
            assert!(payouts(&game, account) <= 1);
        }
    }

    fn game_with_balance(starting_balance: Crystals) -> Game {
        let config = GameConfig {
            starting_balance,
            seed: Some(7),
            ..GameConfig::default()
        };
        Game::with_clock(config, Arc::new(ManualClock::default()))
    }

    #[test]
    fn huge_payouts_settle_without_wrapping() {
        let half = Crystals::new(Crystals::MAX.value() / 2);
        let game = game_with_balance(half);
        let round = game.open_round_with(Mountain::AzureDragon).unwrap();
        for account in ["a", "b", "c"] {
            stake(&game, account, round.id, Some("azure-dragon"), Some(half.signed()));
        }

        let SettleOutcome::Settled(settlement) = game.settle_open_round().unwrap() else {
            panic!("round should have settled");
        };
        assert_eq!(settlement.won, 3);
        assert_eq!(settlement.paid, Crystals::MAX);
        assert!(settlement.next.is_open());

        let reward = half.doubled().unwrap();
        for account in ["a", "b", "c"] {
            let account = AccountId::from(account);
            assert_eq!(game.balance(&account).unwrap(), reward);
            let moved: i64 = game
                .transactions(&account, PageRequest::new(1, 100))
                .items
                .iter()
                .filter(|tx| tx.kind.moves_balance())
                .map(|tx| tx.delta)
                .sum();
            assert_eq!(moved, reward.signed());
        }
        let board = game.leaderboard(10);
        assert!(board.iter().all(|e| e.rank == 1 && e.total_profit == half.signed()));
    }

    #[test]
    fn unrepresentable_payout_leaves_round_open() {
        let game = game_with_balance(Crystals::MAX);
        let round = game.open_round_with(Mountain::WhiteTiger).unwrap();
        let quarter = (Crystals::MAX.value() / 4) as i64;
        stake(&game, "alice", round.id, Some("white-tiger"), Some(quarter));

        let err = game.settle_open_round().unwrap_err();

        assert!(matches!(err, GameError::Storage(_)));
        assert!(game.store.round(round.id).unwrap().is_open());
        assert_eq!(game.open_round().unwrap().id, round.id);
        assert!(game.store.bet(round.id, &"alice".into()).unwrap().is_pending());
    }

    #[test]
    fn balances_reconcile_after_settlement() {
        let (game, _) = game();
        for _ in 0..3 {
            let round = game.ensure_open_round().unwrap();
            stake(&game, "alice", round.id, Some("azure-dragon"), Some(10));
            stake(&game, "bob", round.id, Some("white-tiger"), Some(15));
            stake(&game, "alice", round.id, Some("white-tiger"), None);
            game.settle_open_round().unwrap();
        }

        for account in ["alice", "bob"] {
            let account = AccountId::from(account);
            let moved: i64 = game
                .transactions(&account, crate::model::PageRequest::new(1, 100))
                .items
                .iter()
                .filter(|tx| tx.kind.moves_balance())
                .map(|tx| tx.delta)
                .sum();
            assert_eq!(game.balance(&account).unwrap().signed(), moved);
        }
    }
}
