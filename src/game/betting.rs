use tracing::info;

use super::{Conflict, Game, GameError, ValidationError};
use crate::Crystals;
use crate::model::{AccountId, Bet, Mountain, RoundId, TxRef, UnknownMountain};

/// A bet placement or amendment as received from a caller.
///
/// Fields are kept loose so that every malformed variant is rejected with a
/// specific [`ValidationError`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BetRequest {
    pub round: Option<RoundId>,
    pub mountain: Option<String>,
    /// Stake to add. Absent and zero both mean "no new stake".
    pub amount: Option<i64>,
}

impl Game {
    /// Place the account's first bet of a round, or amend its existing one.
    ///
    /// A first bet needs a mountain and at least one crystal. An amendment
    /// may switch mountain for free and/or add stake; the whole cumulative
    /// stake rides on whichever mountain is chosen last.
    pub fn place_or_amend_bet(
        &self,
        account: &AccountId,
        request: BetRequest,
    ) -> Result<Bet, GameError> {
        let round_id = request.round.ok_or(ValidationError::MissingRound)?;
        let round = self
            .store
            .round(round_id)
            .ok_or(GameError::NotFound(round_id))?;
        if !round.is_open() {
            return Err(GameError::RoundClosed(round_id));
        }
        let mountain = request
            .mountain
            .as_deref()
            .map(str::parse::<Mountain>)
            .transpose()
            .map_err(|UnknownMountain(name)| ValidationError::UnknownMountain(name))?;
        let amount = match request.amount {
            Some(amount) if amount < 0 => {
                return Err(ValidationError::NegativeAmount(amount).into());
            }
            Some(amount) => Crystals::new(amount.unsigned_abs()),
            None => Crystals::ZERO,
        };

        match self.store.bet(round_id, account) {
            None => self.place_first_bet(account, round_id, mountain, amount),
            Some(_) => self.amend_bet(account, round_id, mountain, amount),
        }
    }

    fn place_first_bet(
        &self,
        account: &AccountId,
        round: RoundId,
        mountain: Option<Mountain>,
        amount: Crystals,
    ) -> Result<Bet, GameError> {
        let mountain = match mountain {
            Some(mountain) if !amount.is_zero() => mountain,
            _ => return Err(ValidationError::IncompleteFirstBet.into()),
        };

        let (bet, balance) = self.store.create_bet(
            round,
            account,
            mountain,
            amount,
            self.clock.now(),
            |bet| {
                self.ledger
                    .debit_if_sufficient(account, amount, TxRef::bet(round, bet.id))
                    .map_err(GameError::from)
            },
        )?;

        info!(
            account = %account,
            round,
            bet = bet.id,
            mountain = %mountain,
            amount = %amount,
            balance = %balance,
            "bet placed"
        );
        Ok(bet)
    }

    fn amend_bet(
        &self,
        account: &AccountId,
        round: RoundId,
        mountain: Option<Mountain>,
        amount: Crystals,
    ) -> Result<Bet, GameError> {
        let now = self.clock.now();
        let (bet, balance) = self.store.amend_bet(round, account, |bet| {
            if !bet.is_pending() {
                return Err(GameError::from(Conflict::BetResolved {
                    account: account.clone(),
                    round,
                }));
            }

            let balance = if amount.is_zero() {
                None
            } else {
                let staked = bet.amount.checked_add(amount).ok_or_else(|| {
                    GameError::Storage(format!("stake of bet {} would overflow", bet.id))
                })?;
                let balance =
                    self.ledger
                        .debit_if_sufficient(account, amount, TxRef::bet(round, bet.id))?;
                bet.amount = staked;
                Some(balance)
            };
            if let Some(mountain) = mountain {
                bet.mountain = mountain;
            }
            bet.updated_at = now;
            Ok((bet.clone(), balance))
        })?;

        info!(
            account = %account,
            round,
            bet = bet.id,
            mountain = %bet.mountain,
            added = %amount,
            staked = %bet.amount,
            balance = ?balance.map(|b| b.value()),
            "bet amended"
        );
        Ok(bet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::tests::game;
    use crate::model::{Resolution, TransactionKind};

    fn request(round: RoundId, mountain: Option<&str>, amount: Option<i64>) -> BetRequest {
        BetRequest {
            round: Some(round),
            mountain: mountain.map(str::to_string),
            amount,
        }
    }

    fn alice() -> AccountId {
        AccountId::from("alice")
    }

    #[test]
    fn first_bet_debits_and_creates_pending_bet() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();

        let bet = game
            .place_or_amend_bet(&alice(), request(round.id, Some("azure-dragon"), Some(30)))
            .unwrap();

        assert_eq!(bet.amount, Crystals::new(30));
        assert_eq!(bet.mountain, Mountain::AzureDragon);
        assert_eq!(bet.resolution, Resolution::Pending);
        assert_eq!(bet.reward, Crystals::ZERO);
        assert_eq!(game.balance(&alice()).unwrap(), Crystals::new(70));
    }

    #[test]
    fn missing_round_reference_is_invalid() {
        let (game, _) = game();
        let err = game
            .place_or_amend_bet(&alice(), BetRequest::default())
            .unwrap_err();
        assert!(matches!(
            err,
            GameError::Validation(ValidationError::MissingRound)
        ));
    }

    #[test]
    fn unknown_round_is_not_found() {
        let (game, _) = game();
        let err = game
            .place_or_amend_bet(&alice(), request(99, Some("azure-dragon"), Some(5)))
            .unwrap_err();
        assert!(matches!(err, GameError::NotFound(99)));
    }

    #[test]
    fn settled_round_is_closed() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        game.settle_open_round().unwrap();

        let err = game
            .place_or_amend_bet(&alice(), request(round.id, Some("azure-dragon"), Some(5)))
            .unwrap_err();
        assert!(matches!(err, GameError::RoundClosed(id) if id == round.id));
    }

    #[test]
    fn unknown_mountain_is_invalid() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        let err = game
            .place_or_amend_bet(&alice(), request(round.id, Some("golden"), Some(5)))
            .unwrap_err();
        assert!(matches!(
            err,
            GameError::Validation(ValidationError::UnknownMountain(name)) if name == "golden"
        ));
    }

    #[test]
    fn negative_amount_is_invalid() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        let err = game
            .place_or_amend_bet(&alice(), request(round.id, Some("azure-dragon"), Some(-1)))
            .unwrap_err();
        assert!(matches!(
            err,
            GameError::Validation(ValidationError::NegativeAmount(-1))
        ));
        assert!(game.store.bet(round.id, &alice()).is_none());
    }

    #[test]
    fn first_bet_needs_mountain_and_positive_amount() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();

        for (mountain, amount) in [
            (None, Some(10)),
            (Some("azure-dragon"), None),
            (Some("azure-dragon"), Some(0)),
        ] {
            let err = game
                .place_or_amend_bet(&alice(), request(round.id, mountain, amount))
                .unwrap_err();
            assert!(matches!(
                err,
                GameError::Validation(ValidationError::IncompleteFirstBet)
            ));
        }
        assert!(game.store.bet(round.id, &alice()).is_none());
    }

    #[test]
    fn unfunded_first_bet_leaves_nothing_behind() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();

        let err = game
            .place_or_amend_bet(&alice(), request(round.id, Some("white-tiger"), Some(101)))
            .unwrap_err();

        assert!(matches!(err, GameError::InsufficientFunds { .. }));
        assert!(game.store.bet(round.id, &alice()).is_none());
        assert_eq!(game.balance(&alice()).unwrap(), Crystals::new(100));
    }

    #[test]
    fn amendment_switches_mountain_without_moving_funds() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        game.place_or_amend_bet(&alice(), request(round.id, Some("azure-dragon"), Some(30)))
            .unwrap();

        for amount in [None, Some(0)] {
            let bet = game
                .place_or_amend_bet(&alice(), request(round.id, Some("white-tiger"), amount))
                .unwrap();
            assert_eq!(bet.mountain, Mountain::WhiteTiger);
            assert_eq!(bet.amount, Crystals::new(30));
        }
        assert_eq!(game.balance(&alice()).unwrap(), Crystals::new(70));
    }

    #[test]
    fn amendment_tops_up_cumulative_stake() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        game.place_or_amend_bet(&alice(), request(round.id, Some("azure-dragon"), Some(30)))
            .unwrap();

        let bet = game
            .place_or_amend_bet(&alice(), request(round.id, None, Some(20)))
            .unwrap();

        assert_eq!(bet.amount, Crystals::new(50));
        assert_eq!(bet.mountain, Mountain::AzureDragon);
        assert_eq!(game.balance(&alice()).unwrap(), Crystals::new(50));

        let stakes: i64 = game
            .transactions(&alice(), Default::default())
            .items
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Stake)
            .map(|tx| tx.delta)
            .sum();
        assert_eq!(stakes, -50);
    }

    #[test]
    fn unfunded_top_up_changes_nothing() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        game.place_or_amend_bet(&alice(), request(round.id, Some("azure-dragon"), Some(30)))
            .unwrap();

        let err = game
            .place_or_amend_bet(&alice(), request(round.id, Some("white-tiger"), Some(71)))
            .unwrap_err();

        assert!(matches!(err, GameError::InsufficientFunds { .. }));
        let bet = game.store.bet(round.id, &alice()).unwrap();
        assert_eq!(bet.amount, Crystals::new(30));
        assert_eq!(bet.mountain, Mountain::AzureDragon);
        assert_eq!(game.balance(&alice()).unwrap(), Crystals::new(70));
    }

    #[test]
    fn resolved_bet_rejects_amendment() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        game.place_or_amend_bet(&alice(), request(round.id, Some("azure-dragon"), Some(30)))
            .unwrap();
        game.store
            .update_bet(round.id, &alice(), |bet| {
                bet.resolution = Resolution::Lost;
                Ok::<_, GameError>(())
            })
            .unwrap();

        let err = game
            .place_or_amend_bet(&alice(), request(round.id, None, Some(10)))
            .unwrap_err();

        assert!(matches!(
            err,
            GameError::Conflict(Conflict::BetResolved { .. })
        ));
        assert_eq!(game.balance(&alice()).unwrap(), Crystals::new(70));
    }

    #[test]
    fn sealed_round_rejects_first_bets_and_amendments() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        game.place_or_amend_bet(&alice(), request(round.id, Some("azure-dragon"), Some(30)))
            .unwrap();
        game.store.seal_round(round.id).unwrap();

        let err = game
            .place_or_amend_bet(&"bob".into(), request(round.id, Some("azure-dragon"), Some(5)))
            .unwrap_err();
        assert!(matches!(err, GameError::RoundClosed(_)));

        let err = game
            .place_or_amend_bet(&alice(), request(round.id, Some("white-tiger"), Some(10)))
            .unwrap_err();
        assert!(matches!(err, GameError::RoundClosed(id) if id == round.id));

        let bet = game.store.bet(round.id, &alice()).unwrap();
        assert_eq!(bet.mountain, Mountain::AzureDragon);
        assert_eq!(bet.amount, Crystals::new(30));
        assert_eq!(game.balance(&alice()).unwrap(), Crystals::new(70));
    }

    #[test]
    fn interrupted_settlement_locks_out_pending_bettors() {
        let (game, _) = game();
        let bob = AccountId::from("bob");
        let round = game.open_round_with(Mountain::WhiteTiger).unwrap();
        game.place_or_amend_bet(&alice(), request(round.id, Some("white-tiger"), Some(10)))
            .unwrap();
        game.place_or_amend_bet(&bob, request(round.id, Some("azure-dragon"), Some(10)))
            .unwrap();

        // seal, alice's resolution, alice's payout
        game.store.fail_after(3);
        assert!(game.settle_open_round().is_err());
        game.store.heal();
        assert!(game.store.round(round.id).unwrap().is_open());

        let err = game
            .place_or_amend_bet(&bob, request(round.id, Some("white-tiger"), Some(50)))
            .unwrap_err();
        assert!(matches!(err, GameError::RoundClosed(_)));
        assert_eq!(game.balance(&bob).unwrap(), Crystals::new(90));

        game.settle_open_round().unwrap();
        let bet = game.store.bet(round.id, &bob).unwrap();
        assert_eq!(bet.resolution, Resolution::Lost);
        assert_eq!(bet.amount, Crystals::new(10));
        assert_eq!(game.balance(&bob).unwrap(), Crystals::new(90));
        assert_eq!(game.balance(&alice()).unwrap(), Crystals::new(110));
    }

    #[test]
    fn simultaneous_first_stakes_create_one_bet() {
        let (game, _) = game();
        let game = std::sync::Arc::new(game);
        let round = game.ensure_open_round().unwrap();
        // both callers find no bet before either creates one
        game.store.gate_bet_creation(2);

        let handles: Vec<_> = [10, 15]
            .into_iter()
            .map(|amount| {
                let game = std::sync::Arc::clone(&game);
                std::thread::spawn(move || {
                    game.place_or_amend_bet(
                        &alice(),
                        request(round.id, Some("azure-dragon"), Some(amount)),
                    )
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let placed: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(placed.len(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(GameError::Conflict(Conflict::DuplicateBet { .. }))
        )));

        let staked = placed[0].amount;
        assert!(staked == Crystals::new(10) || staked == Crystals::new(15));
        assert_eq!(
            game.balance(&alice()).unwrap(),
            Crystals::new(100).checked_sub(staked).unwrap()
        );
        assert_eq!(game.store.bet(round.id, &alice()).unwrap().amount, staked);
    }

    #[test]
    fn top_up_beyond_representable_stake_is_refused() {
        let (game, _) = game();
        let round = game.ensure_open_round().unwrap();
        game.place_or_amend_bet(&alice(), request(round.id, Some("azure-dragon"), Some(30)))
            .unwrap();
        game.store
            .update_bet(round.id, &alice(), |bet| {
                bet.amount = Crystals::MAX;
                Ok::<_, GameError>(())
            })
            .unwrap();

        let err = game
            .place_or_amend_bet(&alice(), request(round.id, None, Some(1)))
            .unwrap_err();

        assert!(matches!(err, GameError::Storage(_)));
        assert_eq!(game.balance(&alice()).unwrap(), Crystals::new(70));
    }
}
