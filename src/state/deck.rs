use crate::types::*;
use rand::Rng;

/// Result of drawing from the policy deck
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Drawn {
    pub cards: Vec<Policy>,
    /// Discards were shuffled back into the deck first
    pub reshuffled: bool,
    /// Fewer cards were available than requested
    pub short: bool,
}

/// Draw `count` policies. Committed top-of-deck cards come first; the rest
/// are drawn one at a time weighted by the remaining faction counts. If the
/// deck cannot cover the request the discard pile is reshuffled in first.
pub(crate) fn draw<R: Rng + ?Sized>(state: &mut GameState, count: usize, rng: &mut R) -> Drawn {
    let mut reshuffled = false;
    let available = state.top_of_deck.len() + state.deck.total() as usize;
    if available < count && state.discard.total() > 0 {
        state.deck.liberal += state.discard.liberal;
        state.deck.fascist += state.discard.fascist;
        state.discard = PolicyCounts::default();
        reshuffled = true;
    }

    let from_top = count.min(state.top_of_deck.len());
    let mut cards: Vec<Policy> = state.top_of_deck.drain(..from_top).collect();

    while cards.len() < count {
        let remaining = state.deck.total();
        if remaining == 0 {
            break;
        }
        let pick = if rng.random_range(0..remaining) < state.deck.liberal {
            Team::Liberal
        } else {
            Team::Fascist
        };
        *state.deck.get_mut(pick) -= 1;
        cards.push(pick);
    }

    let short = cards.len() < count;
    Drawn {
        cards,
        reshuffled,
        short,
    }
}

/// Reveal the next `count` policies without consuming them. The revealed
/// cards stay committed to the top of the deck in order.
pub(crate) fn peek<R: Rng + ?Sized>(state: &mut GameState, count: usize, rng: &mut R) -> Drawn {
    let drawn = draw(state, count, rng);
    state.top_of_deck.splice(0..0, drawn.cards.iter().copied());
    drawn
}

/// Check `enacted + undrawn + discard` against the configured deck
pub(crate) fn verify_ledger(state: &GameState, rules: &Rules) -> Result<(), String> {
    for (team, total) in [
        (Team::Liberal, rules.liberal_deck),
        (Team::Fascist, rules.fascist_deck),
    ] {
        let counted = state.ledger_total(team);
        if counted != total {
            return Err(format!(
                "{} policy ledger is {} but the deck holds {}",
                team.as_str(),
                counted,
                total
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fresh() -> GameState {
        GameState {
            deck: PolicyCounts::new(6, 11),
            ..GameState::default()
        }
    }

    #[test]
    fn test_draw_conserves_policies() {
        let rules = Rules::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = fresh();

        for _ in 0..20 {
            let drawn = draw(&mut state, 3, &mut rng);
            assert_eq!(drawn.cards.len(), 3);
            assert!(!drawn.short);
            state.hand = drawn.cards;
            verify_ledger(&state, &rules).unwrap();
            for card in std::mem::take(&mut state.hand) {
                *state.discard.get_mut(card) += 1;
            }
        }
    }

    #[test]
    fn test_draw_reshuffles_when_short() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut state = GameState {
            deck: PolicyCounts::new(1, 1),
            discard: PolicyCounts::new(2, 3),
            enacted: PolicyCounts::new(3, 7),
            ..GameState::default()
        };

        let drawn = draw(&mut state, 3, &mut rng);
        assert!(drawn.reshuffled);
        assert_eq!(drawn.cards.len(), 3);
        assert_eq!(state.discard, PolicyCounts::default());
        assert_eq!(state.deck.total(), 4);
    }

    #[test]
    fn test_draw_uses_top_of_deck_first() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut state = GameState {
            deck: PolicyCounts::new(0, 5),
            top_of_deck: vec![Team::Liberal, Team::Liberal],
            ..GameState::default()
        };

        let drawn = draw(&mut state, 3, &mut rng);
        assert_eq!(drawn.cards, vec![Team::Liberal, Team::Liberal, Team::Fascist]);
        assert!(state.top_of_deck.is_empty());
        assert_eq!(state.deck, PolicyCounts::new(0, 4));
    }

    #[test]
    fn test_draw_reports_short_deck() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut state = GameState {
            deck: PolicyCounts::new(1, 0),
            ..GameState::default()
        };
        let drawn = draw(&mut state, 3, &mut rng);
        assert!(drawn.short);
        assert_eq!(drawn.cards, vec![Team::Liberal]);
    }

    #[test]
    fn test_peek_commits_cards_in_order() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut state = fresh();

        let peeked = peek(&mut state, 3, &mut rng);
        assert_eq!(state.top_of_deck, peeked.cards);
        assert_eq!(state.deck.total(), 14);
        verify_ledger(&state, &Rules::default()).unwrap();

        let drawn = draw(&mut state, 3, &mut rng);
        assert_eq!(drawn.cards, peeked.cards);
        assert!(state.top_of_deck.is_empty());
    }

    #[test]
    fn test_single_faction_deck_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut state = GameState {
            deck: PolicyCounts::new(0, 3),
            ..GameState::default()
        };
        let drawn = draw(&mut state, 3, &mut rng);
        assert_eq!(drawn.cards, vec![Team::Fascist; 3]);
    }

    #[test]
    fn test_ledger_mismatch_is_reported() {
        let state = GameState {
            deck: PolicyCounts::new(6, 10),
            ..GameState::default()
        };
        let err = verify_ledger(&state, &Rules::default()).unwrap_err();
        assert!(err.contains("fascist"));
    }
}
