use super::election::policy_list;
use super::{deck, ignored, text, ActionOrigin, ActionOutcome, AppState, Table};
use crate::channel::{Channel, ChatFragment};
use crate::types::*;

impl AppState {
    /// Draw from the deck, narrating reshuffles and reporting short draws
    pub(crate) async fn draw_policies(&self, table: &mut Table, count: usize) -> Vec<Policy> {
        let drawn = deck::draw(&mut table.state, count, &mut rand::rng());
        self.note_draw(table, &drawn, count).await;
        drawn.cards
    }

    pub(crate) async fn note_draw(&self, table: &Table, drawn: &deck::Drawn, count: usize) {
        if drawn.reshuffled {
            self.narrate(
                &table.key,
                Channel::Public,
                vec![text("The deck has been reshuffled.")],
            )
            .await;
        }
        if drawn.short {
            self.report_integrity(
                &table.key,
                &format!("Drew {} of {} policies", drawn.cards.len(), count),
            )
            .await;
        }
    }

    /// President discards one of the three drawn policies
    pub async fn president_select_policy(
        &self,
        key: &str,
        origin: ActionOrigin,
        index: usize,
    ) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let mut table = match self.open_table(key, &origin).await {
            Ok(table) => table,
            Err(outcome) => return outcome,
        };

        if !table.in_phase(Phase::PresidentSelectingPolicy)
            || !table.is_president(&origin)
            || index >= table.state.hand.len()
        {
            return ignored(key, "president_select_policy");
        }

        let discarded = table.state.hand.remove(index);
        *table.state.discard.get_mut(discarded) += 1;
        table.state.phase = Some(Phase::ChancellorSelectingPolicy);
        table.state.status = "Waiting on chancellor to enact a policy.".to_string();
        tracing::info!(game = key, "President discarded a policy");

        if let Some(chancellor) = table.state.chancellor.clone() {
            let mut chat = vec![text("You received ")];
            chat.extend(policy_list(&table.state.hand));
            chat.push(text(". Choose one to enact."));
            self.narrate(key, Channel::Seat(chancellor), chat).await;
        }

        self.commit(table).await
    }

    /// Chancellor keeps one of two policies and discards the other. With
    /// veto enabled the government then votes on vetoing it.
    pub async fn chancellor_select_policy(
        &self,
        key: &str,
        origin: ActionOrigin,
        index: usize,
    ) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let mut table = match self.open_table(key, &origin).await {
            Ok(table) => table,
            Err(outcome) => return outcome,
        };

        if !table.in_phase(Phase::ChancellorSelectingPolicy)
            || !table.is_chancellor(&origin)
            || index >= table.state.hand.len()
        {
            return ignored(key, "chancellor_select_policy");
        }

        let chosen = table.state.hand.remove(index);
        for other in std::mem::take(&mut table.state.hand) {
            *table.state.discard.get_mut(other) += 1;
        }
        table.state.hand = vec![chosen];

        if table.state.veto_enabled {
            table.state.phase = Some(Phase::ChancellorVoteOnVeto);
            table.state.status = "Chancellor to vote on veto.".to_string();
            if let Some(chancellor) = table.state.chancellor.clone() {
                self.narrate(
                    key,
                    Channel::Seat(chancellor),
                    vec![text("You must vote on whether to veto this agenda.")],
                )
                .await;
            }
        } else {
            self.enact_from_hand(&mut table).await;
        }

        self.commit(table).await
    }

    pub async fn chancellor_veto_vote(
        &self,
        key: &str,
        origin: ActionOrigin,
        veto: bool,
    ) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let mut table = match self.open_table(key, &origin).await {
            Ok(table) => table,
            Err(outcome) => return outcome,
        };

        if !table.in_phase(Phase::ChancellorVoteOnVeto) || !table.is_chancellor(&origin) {
            return ignored(key, "chancellor_veto_vote");
        }

        let chancellor = table
            .state
            .chancellor
            .as_deref()
            .map(|c| table.player_named(c))
            .unwrap_or_else(|| text("The chancellor"));
        self.narrate(
            key,
            Channel::Public,
            vec![
                text("Chancellor "),
                chancellor,
                text(if veto {
                    " has voted to veto this election."
                } else {
                    " has voted not to veto this election."
                }),
            ],
        )
        .await;

        if veto {
            table.state.phase = Some(Phase::PresidentVoteOnVeto);
            table.state.status = "President to vote on veto.".to_string();
        } else {
            self.enact_from_hand(&mut table).await;
        }

        self.commit(table).await
    }

    /// A veto needs both votes; it discards the policy and counts as a
    /// failed election
    pub async fn president_veto_vote(
        &self,
        key: &str,
        origin: ActionOrigin,
        veto: bool,
    ) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let mut table = match self.open_table(key, &origin).await {
            Ok(table) => table,
            Err(outcome) => return outcome,
        };

        if !table.in_phase(Phase::PresidentVoteOnVeto) || !table.is_president(&origin) {
            return ignored(key, "president_veto_vote");
        }

        let president = table
            .state
            .president
            .as_deref()
            .map(|p| table.player_named(p))
            .unwrap_or_else(|| text("The president"));
        self.narrate(
            key,
            Channel::Public,
            vec![
                text("President "),
                president,
                text(if veto {
                    " has voted to veto this election."
                } else {
                    " has voted not to veto this election."
                }),
            ],
        )
        .await;

        if veto {
            tracing::info!(game = key, "Agenda vetoed");
            for vetoed in std::mem::take(&mut table.state.hand) {
                *table.state.discard.get_mut(vetoed) += 1;
            }
            let tracker = self.advance_tracker(&mut table).await;
            if tracker >= ELECTION_TRACKER_LIMIT {
                self.enact_top_deck(&mut table).await;
            } else {
                self.start_turn(&mut table, true).await;
            }
        } else {
            self.enact_from_hand(&mut table).await;
        }

        self.commit(table).await
    }

    async fn enact_from_hand(&self, table: &mut Table) {
        match table.state.hand.pop() {
            Some(policy) => self.enact(table, policy, true).await,
            None => {
                self.report_integrity(&table.key, "Government enacted from an empty hand")
                    .await;
                self.start_turn(table, true).await;
            }
        }
    }

    /// Put a policy on its track, then check wins and grant any power
    pub(crate) async fn enact(&self, table: &mut Table, policy: Policy, by_government: bool) {
        table.state.phase = Some(Phase::EnactPolicy);
        *table.state.enacted.get_mut(policy) += 1;
        table.state.election_tracker_count = 0;
        tracing::info!(
            game = %table.key,
            policy = policy.as_str(),
            by_government,
            "Policy enacted"
        );

        self.narrate(
            &table.key,
            Channel::Public,
            vec![
                text("A "),
                ChatFragment::Policy { policy },
                text(" policy has been enacted."),
            ],
        )
        .await;

        let rules = table.config.rules.clone();
        let enacted = table.state.enacted;

        if enacted.fascist >= rules.veto_zone && !table.state.veto_enabled {
            table.state.veto_enabled = true;
            self.narrate(
                &table.key,
                Channel::Public,
                vec![text("Veto power is now enabled.")],
            )
            .await;
        }

        if enacted.liberal >= rules.liberal_track {
            let reason = format!("{} liberal policies have been enacted.", rules.liberal_track);
            self.end_game(table, Team::Liberal, &reason).await;
            return;
        }
        if enacted.fascist >= rules.fascist_track {
            let reason = format!("{} fascist policies have been enacted.", rules.fascist_track);
            self.end_game(table, Team::Fascist, &reason).await;
            return;
        }

        if by_government
            && policy == Team::Fascist
            && !table.state.powers_granted.contains(&enacted.fascist)
        {
            if let Some(power) = rules.power_at(enacted.fascist, table.state.seats.len()) {
                table.state.powers_granted.push(enacted.fascist);
                self.grant_power(table, power).await;
                return;
            }
        }

        self.start_turn(table, true).await;
    }

    /// Enact the top policy without a government after repeated failures
    pub(crate) async fn enact_top_deck(&self, table: &mut Table) {
        table.state.previous_president = None;
        table.state.previous_chancellor = None;
        self.narrate(
            &table.key,
            Channel::Public,
            vec![text(
                "The election tracker is full. The top policy is enacted.",
            )],
        )
        .await;

        let drawn = self.draw_policies(table, 1).await;
        match drawn.first() {
            Some(policy) => self.enact(table, *policy, false).await,
            None => {
                table.state.election_tracker_count = 0;
                self.start_turn(table, true).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    /// Elected government holding a rigged hand
    async fn with_hand(state: &AppState, key: &str, hand: Vec<Policy>) -> GameState {
        elect(state, key).await;
        rig(state, key, |g| {
            // Return the drawn hand to the deck and take the rigged one out
            for card in std::mem::take(&mut g.hand) {
                *g.deck.get_mut(card) += 1;
            }
            for card in &hand {
                *g.deck.get_mut(*card) -= 1;
            }
            g.hand = hand;
        })
        .await;
        load(state, key).await
    }

    #[tokio::test]
    async fn test_government_enacts_chosen_policy() {
        let state = AppState::new();
        let key = started_game(&state, 5, request(5, 5)).await;
        let game = with_hand(&state, &key, vec![Team::Fascist, Team::Liberal, Team::Liberal]).await;

        assert_eq!(
            state.chancellor_select_policy(&key, chancellor(&game), 0).await,
            ActionOutcome::Ignored
        );
        assert_eq!(
            state.president_select_policy(&key, president(&game), 0).await,
            ActionOutcome::Applied
        );

        let game = load(&state, &key).await;
        assert_eq!(game.phase, Some(Phase::ChancellorSelectingPolicy));
        assert_eq!(game.hand, vec![Team::Liberal, Team::Liberal]);
        assert_eq!(game.discard, PolicyCounts::new(0, 1));

        // Out of range is ignored
        assert_eq!(
            state.chancellor_select_policy(&key, chancellor(&game), 2).await,
            ActionOutcome::Ignored
        );
        assert_eq!(
            state.chancellor_select_policy(&key, chancellor(&game), 1).await,
            ActionOutcome::Applied
        );

        let game = load(&state, &key).await;
        assert_eq!(game.enacted, PolicyCounts::new(1, 0));
        assert_eq!(game.discard, PolicyCounts::new(1, 1));
        assert!(game.hand.is_empty());
        assert_eq!(game.phase, Some(Phase::SelectingChancellor));
        assert_eq!(game.election_count, 2);
        assert_eq!(game.ledger_total(Team::Liberal), 6);
        assert_eq!(game.ledger_total(Team::Fascist), 11);
    }

    #[tokio::test]
    async fn test_veto_requires_both_votes() {
        let state = AppState::new();
        let key = started_game(&state, 5, request(5, 5)).await;
        rig(&state, &key, |g| {
            g.veto_enabled = true;
            g.enacted = PolicyCounts::new(0, 5);
            g.deck = PolicyCounts::new(6, 6);
        })
        .await;
        let game = with_hand(&state, &key, vec![Team::Fascist, Team::Fascist, Team::Liberal]).await;

        state.president_select_policy(&key, president(&game), 0).await;
        state.chancellor_select_policy(&key, chancellor(&game), 1).await;
        let game = load(&state, &key).await;
        assert_eq!(game.phase, Some(Phase::ChancellorVoteOnVeto));
        assert_eq!(game.hand, vec![Team::Liberal]);

        state.chancellor_veto_vote(&key, chancellor(&game), true).await;
        let game = load(&state, &key).await;
        assert_eq!(game.phase, Some(Phase::PresidentVoteOnVeto));

        // President refuses: the chancellor's policy is enacted
        state.president_veto_vote(&key, president(&game), false).await;
        let game = load(&state, &key).await;
        assert_eq!(game.enacted, PolicyCounts::new(1, 5));
        assert_eq!(game.phase, Some(Phase::SelectingChancellor));
    }

    #[tokio::test]
    async fn test_successful_veto_discards_and_advances_tracker() {
        let state = AppState::new();
        let key = started_game(&state, 5, request(5, 5)).await;
        rig(&state, &key, |g| {
            g.veto_enabled = true;
            g.enacted = PolicyCounts::new(0, 5);
            g.deck = PolicyCounts::new(6, 6);
        })
        .await;
        let game = with_hand(&state, &key, vec![Team::Fascist, Team::Fascist, Team::Fascist]).await;
        let first_president = game.president_index.unwrap();

        state.president_select_policy(&key, president(&game), 0).await;
        state.chancellor_select_policy(&key, chancellor(&game), 0).await;
        state.chancellor_veto_vote(&key, chancellor(&game), true).await;
        assert_eq!(
            state.president_veto_vote(&key, president(&game), true).await,
            ActionOutcome::Applied
        );

        let game = load(&state, &key).await;
        assert_eq!(game.enacted, PolicyCounts::new(0, 5));
        assert_eq!(game.discard, PolicyCounts::new(0, 3));
        assert_eq!(game.election_tracker_count, 1);
        assert_eq!(game.phase, Some(Phase::SelectingChancellor));
        assert_ne!(game.president_index, Some(first_president));
        assert_eq!(game.stage, Stage::Playing);
    }

    #[tokio::test]
    async fn test_chancellor_declining_veto_enacts() {
        let state = AppState::new();
        let key = started_game(&state, 5, request(5, 5)).await;
        rig(&state, &key, |g| {
            g.veto_enabled = true;
            g.enacted = PolicyCounts::new(4, 5);
            g.deck = PolicyCounts::new(2, 6);
        })
        .await;
        let game = with_hand(&state, &key, vec![Team::Liberal, Team::Liberal, Team::Fascist]).await;

        state.president_select_policy(&key, president(&game), 2).await;
        state.chancellor_select_policy(&key, chancellor(&game), 0).await;
        state.chancellor_veto_vote(&key, chancellor(&game), false).await;

        let game = load(&state, &key).await;
        assert_eq!(game.stage, Stage::Ended);
        assert_eq!(game.winner, Some(Team::Liberal));
    }

    #[tokio::test]
    async fn test_fifth_fascist_policy_enables_veto() {
        let state = AppState::new();
        let key = started_game(&state, 5, request(5, 5)).await;
        rig(&state, &key, |g| {
            g.enacted = PolicyCounts::new(0, 4);
            g.powers_granted = vec![3, 4];
            g.deck = PolicyCounts::new(6, 7);
        })
        .await;
        let game = with_hand(&state, &key, vec![Team::Fascist, Team::Fascist, Team::Fascist]).await;

        state.president_select_policy(&key, president(&game), 0).await;
        state.chancellor_select_policy(&key, chancellor(&game), 0).await;

        let game = load(&state, &key).await;
        assert_eq!(game.enacted, PolicyCounts::new(0, 5));
        assert!(game.veto_enabled);
        // Five players: the fifth fascist policy grants an execution
        assert_eq!(game.pending_power, Some(Power::Execution));
        assert_eq!(game.phase, Some(Phase::Powers));
    }
}
