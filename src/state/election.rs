use super::{ignored, text, ActionOrigin, ActionOutcome, AppState, Table};
use crate::channel::{Channel, ChatFragment};
use crate::types::*;

/// Seats the president may nominate. The previous chancellor is always
/// barred; the previous president only while more than five players live.
pub(crate) fn eligible_chancellors(table: &Table) -> Vec<usize> {
    let state = &table.state;
    let living = table.living_count();
    table
        .living()
        .into_iter()
        .filter(|&i| {
            let user = &state.seats[i];
            Some(i) != state.president_index
                && state.previous_chancellor.as_ref() != Some(user)
                && (living <= 5 || state.previous_president.as_ref() != Some(user))
        })
        .collect()
}

impl AppState {
    /// Seat the next president and wait for a nomination. With `advance`
    /// unset the current president index is kept (first turn of a game).
    pub(crate) async fn start_turn(&self, table: &mut Table, advance: bool) {
        let index = if !advance {
            table.state.president_index.unwrap_or(0)
        } else if let Some(special) = table.state.special_election_president_index.take() {
            special
        } else if let Some(former) = table.state.special_election_former_president_index.take() {
            table.next_living_after(former)
        } else {
            match table.state.president_index {
                Some(current) => table.next_living_after(current),
                None => table.living().first().copied().unwrap_or(0),
            }
        };

        let state = &mut table.state;
        state.president_index = Some(index);
        state.president = state.seats.get(index).cloned();
        state.chancellor = None;
        state.pending_chancellor = None;
        state.ballots.clear();
        state.election_count += 1;
        state.phase = Some(Phase::SelectingChancellor);
        state.status = format!(
            "Election #{}: president to select chancellor.",
            state.election_count
        );

        let eligible = eligible_chancellors(table);
        table.state.notified = eligible
            .iter()
            .filter_map(|i| table.seat(*i).cloned())
            .collect();

        for (user, mut card) in self.store.cards(&table.key).await {
            if card.displayed && card.front == CardFront::Ballot {
                card.displayed = false;
                self.store.set_card(&table.key, &user, card).await;
            }
        }

        if let Some(president) = table.state.president.clone() {
            if !table.config.disable_gamechat {
                self.narrate(
                    &table.key,
                    Channel::Seat(president),
                    vec![text("You are president and must select a chancellor.")],
                )
                .await;
            }
        }
        self.narrate(
            &table.key,
            Channel::Public,
            vec![
                text(format!("Election #{}: ", table.state.election_count)),
                table.player(index),
                text(" is president."),
            ],
        )
        .await;
    }

    pub async fn select_chancellor(
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

        if !table.in_phase(Phase::SelectingChancellor) || !table.is_president(&origin) {
            return ignored(key, "select_chancellor");
        }
        if !eligible_chancellors(&table).contains(&index) {
            return ignored(key, "select_chancellor");
        }

        let Some(nominee) = table.seat(index).cloned() else {
            return ignored(key, "select_chancellor");
        };
        tracing::info!(game = key, "Chancellor nominated: seat {}", index);

        table.state.pending_chancellor = Some(nominee);
        table.state.phase = Some(Phase::Voting);
        table.state.ballots.clear();
        table.state.status = format!("Vote on election #{} now.", table.state.election_count);

        for i in table.living() {
            if let Some(user) = table.seat(i) {
                self.store.add_to_group(key, Group::Loader, user).await;
                self.store.set_card(key, user, Card::ballot(None)).await;
            }
        }

        let president = table.state.president_index.unwrap_or(0);
        self.narrate(
            key,
            Channel::Player,
            vec![
                text("You must vote for the election of president "),
                table.player(president),
                text(" and chancellor "),
                table.player(index),
                text("."),
            ],
        )
        .await;
        self.narrate(
            key,
            Channel::Observer,
            vec![
                text("President "),
                table.player(president),
                text(" nominates "),
                table.player(index),
                text(" as chancellor."),
            ],
        )
        .await;

        self.commit(table).await
    }

    /// Cast or change a ballot. The tally runs once every living seat voted.
    pub async fn cast_vote(&self, key: &str, origin: ActionOrigin, vote: bool) -> ActionOutcome {
        // Voting has no deadline, so only players vote
        let ActionOrigin::Player(ref user) = origin else {
            return ignored(key, "vote");
        };

        let _guard = self.locks.acquire_write(key).await;
        let mut table = match self.open_table(key, &origin).await {
            Ok(table) => table,
            Err(outcome) => return outcome,
        };

        if !table.in_phase(Phase::Voting) {
            return ignored(key, "vote");
        }
        match table.state.seat_index(user) {
            Some(index) if table.is_living(index) => {}
            _ => return ignored(key, "vote"),
        }

        table.state.ballots.insert(user.clone(), vote);
        self.store.remove_from_group(key, Group::Loader, user).await;
        self.store.set_card(key, user, Card::ballot(Some(vote))).await;

        if table.state.ballots.len() >= table.living_count() {
            self.tally(&mut table).await;
        }

        self.commit(table).await
    }

    async fn tally(&self, table: &mut Table) {
        let living = table.living_count();
        let yes = table.state.ballots.values().filter(|v| **v).count();
        let passed = yes * 2 > living;

        for (user, vote) in table.state.ballots.clone() {
            let mut card = Card::ballot(Some(vote));
            card.flipped = true;
            self.store.set_card(&table.key, &user, card).await;
        }
        self.store.clear_group(&table.key, Group::Loader).await;

        tracing::info!(
            game = %table.key,
            yes,
            living,
            passed,
            "Election #{} tallied",
            table.state.election_count
        );
        self.narrate(
            &table.key,
            Channel::Public,
            vec![text(format!(
                "The election {} ({} ja, {} nein).",
                if passed { "passes" } else { "fails" },
                yes,
                living - yes
            ))],
        )
        .await;

        if passed {
            self.election_passed(table).await;
        } else {
            self.election_failed(table).await;
        }
    }

    async fn election_passed(&self, table: &mut Table) {
        table.state.chancellor = table.state.pending_chancellor.take();
        table.state.notified.clear();
        let Some(chancellor) = table.state.chancellor.clone() else {
            return;
        };

        let rules = &table.config.rules;
        if table.state.enacted.fascist >= rules.hitler_zone {
            if self
                .store
                .is_member(&table.key, Group::Hitler, &chancellor)
                .await
            {
                self.end_game(table, Team::Fascist, "Hitler has been elected chancellor.")
                    .await;
                return;
            }
            let chancellor_fragment = table.player_named(&chancellor);
            self.narrate(
                &table.key,
                Channel::Public,
                vec![chancellor_fragment, text(" is not Hitler.")],
            )
            .await;
        }

        table.state.previous_president = table.state.president.clone();
        table.state.previous_chancellor = Some(chancellor);

        let hand = self.draw_policies(table, HAND_SIZE).await;
        table.state.hand = hand.clone();
        table.state.phase = Some(Phase::PresidentSelectingPolicy);
        table.state.status = "Waiting on president to discard one policy.".to_string();

        if let Some(president) = table.state.president.clone() {
            let mut chat = vec![text("You drew ")];
            chat.extend(policy_list(&hand));
            chat.push(text(". Choose one to discard."));
            self.narrate(&table.key, Channel::Seat(president), chat).await;
        }
    }

    async fn election_failed(&self, table: &mut Table) {
        table.state.pending_chancellor = None;
        let tracker = self.advance_tracker(table).await;
        self.narrate(
            &table.key,
            Channel::Public,
            vec![text(format!("The election tracker moves to {}.", tracker))],
        )
        .await;

        if tracker >= ELECTION_TRACKER_LIMIT {
            self.enact_top_deck(table).await;
        } else {
            self.start_turn(table, true).await;
        }
    }

    /// Bump the election tracker through the store's atomic counter
    pub(crate) async fn advance_tracker(&self, table: &mut Table) -> u32 {
        if let Err(e) = self.store.save_state(&table.key, &table.state).await {
            tracing::error!("Failed to save game {}: {}", table.key, e);
        }
        match self
            .store
            .incr_state(&table.key, "electionTrackerCount", 1)
            .await
        {
            Ok(before) => table.state.election_tracker_count = before as u32 + 1,
            Err(e) => {
                tracing::error!("Failed to advance tracker for {}: {}", table.key, e);
                table.state.election_tracker_count += 1;
            }
        }
        table.state.election_tracker_count
    }
}

/// "liberal, fascist and fascist" as chat fragments
pub(crate) fn policy_list(policies: &[Policy]) -> Vec<ChatFragment> {
    let mut chat = Vec::new();
    for (i, policy) in policies.iter().enumerate() {
        if i > 0 {
            let sep = if i + 1 == policies.len() { " and " } else { ", " };
            chat.push(text(sep));
        }
        chat.push(ChatFragment::Policy { policy: *policy });
    }
    chat
}
