use super::election::policy_list;
use super::{deck, ignored, text, ActionOrigin, ActionOutcome, AppState, Table};
use crate::channel::{Channel, ChatFragment};
use crate::types::*;

impl AppState {
    /// Enter the powers phase. Peeks are dealt out immediately and the
    /// president confirms them; targeted powers wait for a seat.
    pub(crate) async fn grant_power(&self, table: &mut Table, power: Power) {
        table.state.phase = Some(Phase::Powers);
        table.state.pending_power = Some(power);
        table.state.status = power.instruction().to_string();
        tracing::info!(game = %table.key, power = ?power, "Power granted");

        self.narrate(&table.key, Channel::Public, vec![text(power.instruction())])
            .await;

        let peek = match power {
            Power::DeckPeek => HAND_SIZE,
            Power::PeekDrop => 1,
            _ => return,
        };
        let drawn = deck::peek(&mut table.state, peek, &mut rand::rng());
        self.note_draw(table, &drawn, peek).await;

        if let Some(president) = table.state.president.clone() {
            let mut chat = vec![text("The top of the deck holds ")];
            chat.extend(policy_list(&drawn.cards));
            chat.push(text(if power == Power::PeekDrop {
                ". You may discard it."
            } else {
                "."
            }));
            self.narrate(&table.key, Channel::Seat(president), chat).await;
        }
    }

    /// Seats the pending power may target
    pub(crate) async fn power_targets(&self, table: &Table) -> Vec<usize> {
        let Some(power) = table.state.pending_power else {
            return Vec::new();
        };
        let investigated = if power == Power::Investigate {
            self.store
                .group_members(&table.key, Group::Investigated)
                .await
        } else {
            Vec::new()
        };
        table
            .living()
            .into_iter()
            .filter(|&i| {
                Some(i) != table.state.president_index
                    && table.seat(i).is_some_and(|u| !investigated.contains(u))
            })
            .collect()
    }

    /// Load a game waiting on `power` from its president
    async fn open_power(
        &self,
        key: &str,
        origin: &ActionOrigin,
        power: Power,
        action: &str,
    ) -> Result<Table, ActionOutcome> {
        let table = self.open_table(key, origin).await?;
        if !table.in_phase(Phase::Powers)
            || table.state.pending_power != Some(power)
            || !table.is_president(origin)
        {
            return Err(ignored(key, action));
        }
        Ok(table)
    }

    async fn open_targeted(
        &self,
        key: &str,
        origin: &ActionOrigin,
        power: Power,
        index: usize,
        action: &str,
    ) -> Result<(Table, UserKey), ActionOutcome> {
        let table = self.open_power(key, origin, power, action).await?;
        if !self.power_targets(&table).await.contains(&index) {
            return Err(ignored(key, action));
        }
        match table.seat(index).cloned() {
            Some(target) => Ok((table, target)),
            None => Err(ignored(key, action)),
        }
    }

    /// Resolve the power and resume succession
    async fn finish_power(&self, table: &mut Table) {
        table.state.pending_power = None;
        self.start_turn(table, true).await;
    }

    fn president_fragment(table: &Table) -> ChatFragment {
        table
            .state
            .president_index
            .map(|i| table.player(i))
            .unwrap_or_else(|| text("The president"))
    }

    pub async fn investigate(&self, key: &str, origin: ActionOrigin, index: usize) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let (mut table, target) = match self
            .open_targeted(key, &origin, Power::Investigate, index, "investigate")
            .await
        {
            Ok(opened) => opened,
            Err(outcome) => return outcome,
        };

        let team = self.role_of(key, &target).await.team();
        self.store.add_to_group(key, Group::Investigated, &target).await;
        tracing::info!(game = key, "President investigated seat {}", index);

        let president = Self::president_fragment(&table);
        self.narrate(
            key,
            Channel::Public,
            vec![
                text("President "),
                president,
                text(" investigates the party membership of "),
                table.player(index),
                text("."),
            ],
        )
        .await;
        if let Some(user) = table.state.president.clone() {
            self.narrate(
                key,
                Channel::Seat(user),
                vec![
                    table.player(index),
                    text(format!(" is on the {} team.", team.as_str())),
                ],
            )
            .await;
        }

        self.finish_power(&mut table).await;
        self.commit(table).await
    }

    /// President acknowledges the peeked policies
    pub async fn confirm_policy_peek(&self, key: &str, origin: ActionOrigin) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let mut table = match self
            .open_power(key, &origin, Power::DeckPeek, "confirm_policy_peek")
            .await
        {
            Ok(table) => table,
            Err(outcome) => return outcome,
        };

        let president = Self::president_fragment(&table);
        self.narrate(
            key,
            Channel::Public,
            vec![
                text("President "),
                president,
                text(" has examined the top three policies."),
            ],
        )
        .await;

        self.finish_power(&mut table).await;
        self.commit(table).await
    }

    /// The chosen seat presides next; afterwards the order resumes after
    /// the president who called the election
    pub async fn special_election(
        &self,
        key: &str,
        origin: ActionOrigin,
        index: usize,
    ) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let (mut table, _target) = match self
            .open_targeted(key, &origin, Power::SpecialElection, index, "special_election")
            .await
        {
            Ok(opened) => opened,
            Err(outcome) => return outcome,
        };

        table.state.special_election_former_president_index = table.state.president_index;
        table.state.special_election_president_index = Some(index);

        let president = Self::president_fragment(&table);
        self.narrate(
            key,
            Channel::Public,
            vec![
                text("President "),
                president,
                text(" has chosen "),
                table.player(index),
                text(" for a special election."),
            ],
        )
        .await;

        self.finish_power(&mut table).await;
        self.commit(table).await
    }

    pub async fn execute(&self, key: &str, origin: ActionOrigin, index: usize) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let (mut table, target) = match self
            .open_targeted(key, &origin, Power::Execution, index, "execute")
            .await
        {
            Ok(opened) => opened,
            Err(outcome) => return outcome,
        };

        self.store.add_to_group(key, Group::Dead, &target).await;
        self.store.remove_from_group(key, Group::Remake, &target).await;
        table.dead.insert(target.clone());
        tracing::info!(game = key, "Seat {} executed", index);

        let president = Self::president_fragment(&table);
        self.narrate(
            key,
            Channel::Public,
            vec![
                text("President "),
                president,
                text(" executes "),
                table.player(index),
                text("."),
            ],
        )
        .await;

        if self.store.is_member(key, Group::Hitler, &target).await {
            table.state.pending_power = None;
            self.end_game(&mut table, Team::Liberal, "Hitler has been executed.")
                .await;
        } else {
            self.finish_power(&mut table).await;
        }
        self.commit(table).await
    }

    /// President shows their own party membership to one seat
    pub async fn reveal_loyalty(
        &self,
        key: &str,
        origin: ActionOrigin,
        index: usize,
    ) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let (mut table, target) = match self
            .open_targeted(key, &origin, Power::ReverseInvestigate, index, "reveal_loyalty")
            .await
        {
            Ok(opened) => opened,
            Err(outcome) => return outcome,
        };

        let team = match table.state.president.as_deref() {
            Some(president) => self.role_of(key, president).await.team(),
            None => return ignored(key, "reveal_loyalty"),
        };

        let president = Self::president_fragment(&table);
        self.narrate(
            key,
            Channel::Public,
            vec![
                text("President "),
                president.clone(),
                text(" reveals their party membership to "),
                table.player(index),
                text("."),
            ],
        )
        .await;
        self.narrate(
            key,
            Channel::Seat(target),
            vec![
                text("President "),
                president,
                text(format!(" is on the {} team.", team.as_str())),
            ],
        )
        .await;

        self.finish_power(&mut table).await;
        self.commit(table).await
    }

    /// Keep or burn the peeked top policy
    pub async fn peek_drop(&self, key: &str, origin: ActionOrigin, drop: bool) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let mut table = match self
            .open_power(key, &origin, Power::PeekDrop, "peek_drop")
            .await
        {
            Ok(table) => table,
            Err(outcome) => return outcome,
        };

        let president = Self::president_fragment(&table);
        if drop && !table.state.top_of_deck.is_empty() {
            let burned = table.state.top_of_deck.remove(0);
            *table.state.discard.get_mut(burned) += 1;
            self.narrate(
                key,
                Channel::Public,
                vec![
                    text("President "),
                    president,
                    text(" has discarded the top policy."),
                ],
            )
            .await;
        } else {
            self.narrate(
                key,
                Channel::Public,
                vec![
                    text("President "),
                    president,
                    text(" has kept the top policy."),
                ],
            )
            .await;
        }

        self.finish_power(&mut table).await;
        self.commit(table).await
    }
}
