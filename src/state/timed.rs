use super::election::eligible_chancellors;
use super::{ActionOrigin, ActionOutcome, AppState};
use crate::types::*;
use futures::future::BoxFuture;
use rand::seq::IndexedRandom;
use rand::Rng;

/// Timer callback. Boxed because the action it submits may schedule the
/// next deadline.
pub(crate) fn expire(state: AppState, key: GameKey, token: TimerToken) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let outcome = state.handle_timeout(&key, token).await;
        tracing::debug!(game = %key, token, ?outcome, "Deadline expired");
    })
}

impl AppState {
    /// Submit a random valid action for the step the game is waiting on.
    /// The entry point re-validates the token under the game lock, so a
    /// stale deadline is a no-op.
    pub async fn handle_timeout(&self, key: &str, token: TimerToken) -> ActionOutcome {
        let table = match self.load_table(key).await {
            Ok(Some(table)) => table,
            _ => return ActionOutcome::Ignored,
        };
        if table.state.timer_token != Some(token) {
            return ActionOutcome::Ignored;
        }

        let origin = ActionOrigin::Timer(token);
        let hand = table.state.hand.len().max(1);

        match table.state.phase {
            Some(Phase::SelectingChancellor) => {
                let pick = eligible_chancellors(&table)
                    .choose(&mut rand::rng())
                    .copied();
                match pick {
                    Some(index) => self.select_chancellor(key, origin, index).await,
                    None => ActionOutcome::Ignored,
                }
            }
            Some(Phase::PresidentSelectingPolicy) => {
                let index = rand::rng().random_range(0..hand);
                self.president_select_policy(key, origin, index).await
            }
            Some(Phase::ChancellorSelectingPolicy) => {
                let index = rand::rng().random_range(0..hand);
                self.chancellor_select_policy(key, origin, index).await
            }
            Some(Phase::ChancellorVoteOnVeto) => {
                self.chancellor_veto_vote(key, origin, rand::random())
                    .await
            }
            Some(Phase::PresidentVoteOnVeto) => {
                self.president_veto_vote(key, origin, rand::random())
                    .await
            }
            Some(Phase::Powers) => {
                let targets = self.power_targets(&table).await;
                let target = targets.choose(&mut rand::rng()).copied();
                match (table.state.pending_power, target) {
                    (Some(Power::DeckPeek), _) => self.confirm_policy_peek(key, origin).await,
                    (Some(Power::PeekDrop), _) => {
                        self.peek_drop(key, origin, rand::random()).await
                    }
                    (Some(Power::Investigate), Some(index)) => {
                        self.investigate(key, origin, index).await
                    }
                    (Some(Power::SpecialElection), Some(index)) => {
                        self.special_election(key, origin, index).await
                    }
                    (Some(Power::Execution), Some(index)) => {
                        self.execute(key, origin, index).await
                    }
                    (Some(Power::ReverseInvestigate), Some(index)) => {
                        self.reveal_loyalty(key, origin, index).await
                    }
                    _ => ActionOutcome::Ignored,
                }
            }
            _ => ActionOutcome::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::time::Duration;

    fn timed(secs: u32) -> crate::protocol::CreateGameRequest {
        let mut req = request(5, 5);
        req.timed_mode = Some(secs);
        req
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_nominates_once() {
        let state = AppState::new();
        let key = started_game(&state, 5, timed(2)).await;
        let game = load(&state, &key).await;
        assert!(game.timer_token.is_some());
        assert!(game.deadline.is_some());

        tokio::time::sleep(Duration::from_secs(3)).await;

        let game = load(&state, &key).await;
        assert_eq!(game.phase, Some(Phase::Voting));
        assert!(game.pending_chancellor.is_some());
        assert_eq!(game.election_count, 1);
        // Voting has no deadline
        assert_eq!(game.timer_token, None);
        assert_eq!(state.timers.pending(&key).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_after_deadline_is_ignored() {
        let state = AppState::new();
        let key = started_game(&state, 5, timed(2)).await;
        let game = load(&state, &key).await;
        let nominee = eligible(&game, &[]);

        // Hold the game so the deadline passes before anyone can act
        let guard = state.locks.acquire_write(&key).await;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let player = {
            let state = state.clone();
            let key = key.clone();
            let origin = president(&game);
            tokio::spawn(async move { state.select_chancellor(&key, origin, nominee).await })
        };
        tokio::task::yield_now().await;
        drop(guard);

        assert_eq!(player.await.unwrap(), ActionOutcome::Ignored);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let game = load(&state, &key).await;
        assert_eq!(game.phase, Some(Phase::Voting));
        assert_eq!(game.election_count, 1);
        assert!(game.pending_chancellor.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_before_deadline_cancels_it() {
        let state = AppState::new();
        let key = started_game(&state, 5, timed(2)).await;
        let game = load(&state, &key).await;
        let nominee = eligible(&game, &[]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            state.select_chancellor(&key, president(&game), nominee).await,
            ActionOutcome::Applied
        );
        tokio::time::sleep(Duration::from_secs(5)).await;

        let game = load(&state, &key).await;
        assert_eq!(game.pending_chancellor.as_ref(), Some(&game.seats[nominee]));
        assert_eq!(game.phase, Some(Phase::Voting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_is_ignored() {
        let state = AppState::new();
        let key = started_game(&state, 5, timed(60)).await;
        let game = load(&state, &key).await;
        let token = game.timer_token.unwrap();

        assert_eq!(
            state.handle_timeout(&key, token + 100).await,
            ActionOutcome::Ignored
        );
        assert_eq!(state.handle_timeout(&key, token).await, ActionOutcome::Applied);
        // The token was replaced when the step advanced
        assert_eq!(state.handle_timeout(&key, token).await, ActionOutcome::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_game_plays_through_policy_steps() {
        let state = AppState::new();
        let key = started_game(&state, 5, timed(2)).await;
        elect(&state, &key).await;

        // President discard and chancellor enactment both time out
        tokio::time::sleep(Duration::from_secs(5)).await;

        let game = load(&state, &key).await;
        assert_eq!(game.enacted.total(), 1);
        assert_eq!(game.election_count, 2);
        assert_eq!(game.ledger_total(Team::Liberal), 6);
        assert_eq!(game.ledger_total(Team::Fascist), 11);
    }

    fn assert_conserved(game: &GameState) {
        assert_eq!(game.ledger_total(Team::Liberal), 6);
        assert_eq!(game.ledger_total(Team::Fascist), 11);
    }

    /// Park a timed game on `phase` under its running deadline, let the
    /// deadline pass once and return the state before and after
    async fn expire_in(
        state: &AppState,
        players: usize,
        f: impl FnOnce(&mut GameState),
    ) -> (GameKey, GameState, GameState) {
        let mut req = request(players as u32, players as u32);
        req.timed_mode = Some(2);
        let key = started_game(state, players, req).await;
        rig(state, &key, f).await;
        let before = load(state, &key).await;
        assert!(before.timer_token.is_some());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let after = load(state, &key).await;
        assert_conserved(&after);
        (key, before, after)
    }

    fn with_power(power: Power, peeked: usize) -> impl FnOnce(&mut GameState) {
        move |g: &mut GameState| {
            g.phase = Some(Phase::Powers);
            g.pending_power = Some(power);
            for _ in 0..peeked {
                let card = if g.deck.get(Team::Liberal) > 0 {
                    Team::Liberal
                } else {
                    Team::Fascist
                };
                *g.deck.get_mut(card) -= 1;
                g.top_of_deck.push(card);
            }
        }
    }

    /// The power resolved and the next president waits on a nomination
    fn assert_resolved(before: &GameState, after: &GameState) {
        assert_eq!(after.pending_power, None);
        assert_eq!(after.phase, Some(Phase::SelectingChancellor));
        assert_eq!(after.election_count, before.election_count + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_veto_votes_time_out() {
        let state = AppState::new();
        let (key, before, after) = expire_in(&state, 5, |g| {
            let chancellor = (g.president_index.unwrap() + 1) % g.seats.len();
            g.chancellor = Some(g.seats[chancellor].clone());
            g.veto_enabled = true;
            g.phase = Some(Phase::ChancellorVoteOnVeto);
            g.deck.liberal -= 1;
            g.hand = vec![Team::Liberal];
        })
        .await;

        if after.phase == Some(Phase::PresidentVoteOnVeto) {
            // The chancellor asked for a veto; now the president's deadline runs
            assert_eq!(after.hand, vec![Team::Liberal]);
            assert_ne!(after.timer_token, before.timer_token);

            tokio::time::sleep(Duration::from_millis(2100)).await;
            let last = load(&state, &key).await;
            assert_conserved(&last);
            assert!(last.hand.is_empty());
            assert_eq!(last.phase, Some(Phase::SelectingChancellor));
            let vetoed = last.discard.liberal == 1 && last.election_tracker_count == 1;
            let enacted = last.enacted == PolicyCounts::new(1, 0);
            assert!(vetoed ^ enacted, "{:?}", last);
        } else {
            assert!(after.hand.is_empty());
            assert_eq!(after.enacted, PolicyCounts::new(1, 0));
            assert_eq!(after.phase, Some(Phase::SelectingChancellor));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_deadline_spares_the_president() {
        for _ in 0..6 {
            let state = AppState::new();
            let (key, before, after) = expire_in(&state, 7, with_power(Power::Execution, 0)).await;

            let dead = state.store.group_members(&key, Group::Dead).await;
            assert_eq!(dead.len(), 1);
            let victim = before.seat_index(&dead[0]);
            assert!(victim.is_some());
            assert_ne!(victim, before.president_index);

            if state.store.is_member(&key, Group::Hitler, &dead[0]).await {
                assert_eq!(after.stage, Stage::Ended);
                assert_eq!(after.winner, Some(Team::Liberal));
            } else {
                assert_resolved(&before, &after);
                assert_ne!(after.president.as_ref(), Some(&dead[0]));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_investigation_deadline_picks_another_seat() {
        let state = AppState::new();
        let (key, before, after) = expire_in(&state, 7, with_power(Power::Investigate, 0)).await;

        assert_resolved(&before, &after);
        let investigated = state.store.group_members(&key, Group::Investigated).await;
        assert_eq!(investigated.len(), 1);
        assert_ne!(before.seat_index(&investigated[0]), before.president_index);

        let president = before.president.clone().unwrap();
        let history = state.chat_history(&key, Some(president.as_str())).await;
        assert_eq!(
            history
                .iter()
                .filter(|e| e.render().contains(" team."))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_special_election_deadline_hands_over_presidency() {
        let state = AppState::new();
        let (_, before, after) = expire_in(&state, 7, with_power(Power::SpecialElection, 0)).await;

        assert_resolved(&before, &after);
        assert_ne!(after.president_index, before.president_index);
        assert_eq!(
            after.special_election_former_president_index,
            before.president_index
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reveal_loyalty_deadline_tells_one_seat() {
        let state = AppState::new();
        let (key, before, after) =
            expire_in(&state, 7, with_power(Power::ReverseInvestigate, 0)).await;

        assert_resolved(&before, &after);
        let public = state.chat_history(&key, None).await;
        assert_eq!(
            public
                .iter()
                .filter(|e| e.render().contains("reveals their party membership"))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_deadlines_confirm_or_burn() {
        let state = AppState::new();
        let (_, before, after) = expire_in(&state, 7, with_power(Power::DeckPeek, 3)).await;
        assert_resolved(&before, &after);
        assert_eq!(after.top_of_deck, before.top_of_deck);

        let state = AppState::new();
        let (_, before, after) = expire_in(&state, 7, with_power(Power::PeekDrop, 1)).await;
        assert_resolved(&before, &after);
        let burned = after.discard.total() - before.discard.total();
        assert_eq!(after.top_of_deck.len() as u32 + burned, 1);
    }
}
