//! Position planning for the recruitment board.
//!
//! Columns are numbered densely from zero. Every function here is pure; the
//! handlers load the affected rows, ask for a plan and write only the rows
//! whose placement changed.

use serde::Serialize;
use utoipa::ToSchema;

use crate::model::pipeline::{Candidate, Stage};

/// Where a card sits on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct Card {
    pub id: u64,
    pub stage_id: u64,
    pub position: u32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StageColumn {
    pub id: u64,
    pub name: String,
    pub position: u32,
    pub candidates: Vec<Candidate>,
}

fn column(cards: &[Card], stage_id: u64, skip: u64) -> Vec<Card> {
    let mut col: Vec<Card> = cards
        .iter()
        .filter(|c| c.stage_id == stage_id && c.id != skip)
        .copied()
        .collect();
    col.sort_by_key(|c| (c.position, c.id));
    col
}

fn renumber(col: &[Card], stage_id: u64) -> impl Iterator<Item = Card> + '_ {
    col.iter().enumerate().map(move |(i, c)| Card {
        id: c.id,
        stage_id,
        position: i as u32,
    })
}

fn changed(before: &[Card], after: impl Iterator<Item = Card>) -> Vec<Card> {
    after
        .filter(|a| !before.iter().any(|b| b == a))
        .collect()
}

/// Move `card_id` to `to_index` in `to_stage`, clamping the index.
///
/// `cards` must hold at least the source and target columns. Returns the new
/// placements that differ from the current ones, or `None` when the card is
/// not among `cards`.
pub fn plan_move(cards: &[Card], card_id: u64, to_stage: u64, to_index: usize) -> Option<Vec<Card>> {
    let card = cards.iter().find(|c| c.id == card_id)?;
    let from_stage = card.stage_id;

    let mut target = column(cards, to_stage, card_id);
    let at = to_index.min(target.len());
    target.insert(at, *card);

    let mut after: Vec<Card> = renumber(&target, to_stage).collect();
    if from_stage != to_stage {
        let source = column(cards, from_stage, card_id);
        after.extend(renumber(&source, from_stage));
    }

    Some(changed(cards, after.into_iter()))
}

/// Dense renumbering of one column, e.g. after a card was removed.
pub fn plan_compact(cards: &[Card], stage_id: u64) -> Vec<Card> {
    let col = column(cards, stage_id, 0);
    changed(cards, renumber(&col, stage_id))
}

/// Stage order after moving `stage_id` to `to_index`, as `(id, position)`
/// pairs for the stages whose position changed.
pub fn plan_stage_order(stages: &[Stage], stage_id: u64, to_index: usize) -> Option<Vec<(u64, u32)>> {
    let mut order: Vec<&Stage> = stages.iter().collect();
    order.sort_by_key(|s| (s.position, s.id));

    let from = order.iter().position(|s| s.id == stage_id)?;
    let moved = order.remove(from);
    let at = to_index.min(order.len());
    order.insert(at, moved);

    Some(
        order
            .iter()
            .enumerate()
            .filter(|(i, s)| s.position != *i as u32)
            .map(|(i, s)| (s.id, i as u32))
            .collect(),
    )
}

/// Group candidates under their stages, both in position order.
pub fn build_board(mut stages: Vec<Stage>, mut candidates: Vec<Candidate>) -> Vec<StageColumn> {
    stages.sort_by_key(|s| (s.position, s.id));
    candidates.sort_by_key(|c| (c.position, c.id));

    stages
        .into_iter()
        .map(|stage| {
            let (mine, rest): (Vec<_>, Vec<_>) =
                candidates.drain(..).partition(|c| c.stage_id == stage.id);
            candidates = rest;
            StageColumn {
                id: stage.id,
                name: stage.name,
                position: stage.position,
                candidates: mine,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn card(id: u64, stage_id: u64, position: u32) -> Card {
        Card { id, stage_id, position }
    }

    fn apply(cards: &[Card], plan: &[Card]) -> Vec<Card> {
        let mut out: Vec<Card> = cards
            .iter()
            .map(|c| *plan.iter().find(|p| p.id == c.id).unwrap_or(c))
            .collect();
        out.sort_by_key(|c| (c.stage_id, c.position));
        out
    }

    fn ids_in(cards: &[Card], stage_id: u64) -> Vec<u64> {
        cards.iter().filter(|c| c.stage_id == stage_id).map(|c| c.id).collect()
    }

    fn board() -> Vec<Card> {
        vec![
            card(1, 10, 0),
            card(2, 10, 1),
            card(3, 10, 2),
            card(4, 20, 0),
            card(5, 20, 1),
        ]
    }

    #[test]
    fn move_across_columns_renumbers_both() {
        let cards = board();
        let plan = plan_move(&cards, 2, 20, 1).unwrap();
        let after = apply(&cards, &plan);

        assert_eq!(ids_in(&after, 10), vec![1, 3]);
        assert_eq!(ids_in(&after, 20), vec![4, 2, 5]);
        assert!(after.iter().filter(|c| c.stage_id == 20).map(|c| c.position).eq(0..3));
        assert!(after.iter().filter(|c| c.stage_id == 10).map(|c| c.position).eq(0..2));
    }

    #[test]
    fn move_within_column() {
        let cards = board();
        let plan = plan_move(&cards, 3, 10, 0).unwrap();
        let after = apply(&cards, &plan);
        assert_eq!(ids_in(&after, 10), vec![3, 1, 2]);
        // column 20 is untouched
        assert!(plan.iter().all(|c| c.stage_id == 10));
    }

    #[test]
    fn index_past_the_end_appends() {
        let cards = board();
        let plan = plan_move(&cards, 1, 20, 99).unwrap();
        let after = apply(&cards, &plan);
        assert_eq!(ids_in(&after, 20), vec![4, 5, 1]);
    }

    #[test]
    fn move_into_empty_column() {
        let cards = board();
        let plan = plan_move(&cards, 5, 30, 0).unwrap();
        assert!(plan.contains(&card(5, 30, 0)));
        assert!(plan.iter().all(|c| c.id == 5));
    }

    #[test]
    fn noop_move_changes_nothing() {
        let cards = board();
        assert_eq!(plan_move(&cards, 2, 10, 1), Some(vec![]));
    }

    #[test]
    fn unknown_card_is_none() {
        assert_eq!(plan_move(&board(), 42, 10, 0), None);
    }

    #[test]
    fn gaps_are_closed_by_a_move() {
        let cards = vec![card(1, 10, 0), card(2, 10, 5), card(3, 10, 9)];
        let plan = plan_move(&cards, 1, 10, 2).unwrap();
        let after = apply(&cards, &plan);
        assert_eq!(ids_in(&after, 10), vec![2, 3, 1]);
        assert!(after.iter().map(|c| c.position).eq(0..3));
    }

    #[test]
    fn compact_after_removal() {
        let cards = vec![card(1, 10, 0), card(3, 10, 2), card(4, 10, 3)];
        let plan = plan_compact(&cards, 10);
        assert_eq!(plan, vec![card(3, 10, 1), card(4, 10, 2)]);
    }

    fn stage(id: u64, position: u32) -> Stage {
        Stage { id, name: format!("s{id}"), position }
    }

    #[test]
    fn stage_reorder_reports_changed_positions() {
        let stages = vec![stage(1, 0), stage(2, 1), stage(3, 2), stage(4, 3)];
        let plan = plan_stage_order(&stages, 4, 1).unwrap();
        assert_eq!(plan, vec![(4, 1), (2, 2), (3, 3)]);
        assert_eq!(plan_stage_order(&stages, 9, 0), None);
    }

    #[test]
    fn board_groups_candidates_in_order() {
        let now = Utc::now();
        let cand = |id, stage_id, position| Candidate {
            id,
            stage_id,
            position,
            name: format!("c{id}"),
            email: None,
            phone: None,
            role_applied: None,
            lead_id: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };

        let board = build_board(
            vec![stage(2, 1), stage(1, 0)],
            vec![cand(7, 2, 1), cand(8, 1, 0), cand(9, 2, 0)],
        );

        assert_eq!(board.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(board[0].candidates.iter().map(|c| c.id).collect::<Vec<_>>(), vec![8]);
        assert_eq!(board[1].candidates.iter().map(|c| c.id).collect::<Vec<_>>(), vec![9, 7]);
    }
}
