//! Gameweek points calculation.
//!
//! Pure, store-free implementation of the scoring rules: provisional bonus
//! from BPS ranking, automatic substitutions (upstream-supplied or inferred),
//! captain multiplier normalization, chips and the transfer-cost floor.
//! Callers aggregate per-player stats once per (player, gameweek) before
//! handing them in, which is what keeps double gameweeks single-counted.

use crate::types::api::AutomaticSub;
use crate::types::domain::{Chip, PlayerGameweekStatsRow, Position};
use std::collections::{HashMap, HashSet};

/// One of the fifteen squad slots as stored.
#[derive(Debug, Clone)]
pub struct PickSlot {
    pub player_id: i64,
    /// 1..11 starting XI, 12..15 bench priority order.
    pub position: i32,
    pub multiplier: i32,
    pub is_captain: bool,
    pub is_vice_captain: bool,
}

impl PickSlot {
    pub fn is_starter(&self) -> bool {
        self.position <= 11
    }
}

/// Aggregate fixture status across a player's fixtures in the gameweek.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixtureOutcome {
    /// Every fixture fully finished (bonus confirmed upstream).
    pub all_finished: bool,
    /// Every fixture at least provisionally finished.
    pub all_done: bool,
}

/// Per-player inputs for one gameweek, already summed across DGW rows.
#[derive(Debug, Clone, Default)]
pub struct PlayerGwInput {
    pub minutes: i32,
    /// Sum of per-fixture effective points (provisional bonus included).
    pub effective_points: i32,
    pub fixtures: FixtureOutcome,
    pub position: Option<Position>,
}

impl PlayerGwInput {
    /// Collapse a player's stats rows (one per fixture) into calculator input.
    /// Summing here, once per pick, is what satisfies the DGW rule: a double
    /// gameweek contributes `sum(fixture_points) * multiplier`, never one
    /// multiplied row per fixture.
    pub fn from_stats_rows(rows: &[&PlayerGameweekStatsRow], position: Option<Position>) -> Self {
        if rows.is_empty() {
            return PlayerGwInput {
                position,
                ..Default::default()
            };
        }
        PlayerGwInput {
            minutes: rows.iter().map(|r| r.minutes).sum(),
            effective_points: rows.iter().map(|r| r.effective_points()).sum(),
            fixtures: FixtureOutcome {
                all_finished: rows.iter().all(|r| r.match_finished),
                all_done: rows
                    .iter()
                    .all(|r| r.match_finished || r.match_finished_provisional),
            },
            position,
        }
    }
}

/// Everything the calculator knows about the gameweek's players.
#[derive(Debug, Clone, Default)]
pub struct PointsContext {
    pub players: HashMap<i64, PlayerGwInput>,
}

impl PointsContext {
    fn minutes(&self, player_id: i64) -> i32 {
        self.players.get(&player_id).map_or(0, |p| p.minutes)
    }

    fn effective_points(&self, player_id: i64) -> i32 {
        self.players.get(&player_id).map_or(0, |p| p.effective_points)
    }

    fn fixtures(&self, player_id: i64) -> FixtureOutcome {
        self.players.get(&player_id).map_or_else(FixtureOutcome::default, |p| p.fixtures)
    }

    fn position(&self, player_id: i64) -> Option<Position> {
        self.players.get(&player_id).and_then(|p| p.position)
    }
}

/// Result of a gameweek calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameweekPoints {
    pub raw_points: i32,
    /// `max(0, raw - transfer_cost)`.
    pub gameweek_points: i32,
    pub transfer_cost: i32,
    /// The substitutions actually applied (upstream-adopted or inferred).
    pub auto_subs: Vec<AutomaticSub>,
}

/// Provisional bonus from BPS ranking within one fixture: the top three BPS
/// receive 3/2/1, ties share the lower contended rank (35, 30, 30, 25 gives
/// 3, 2, 2, 0).
pub fn provisional_bonus(player_bps: i32, fixture_bps: &[i32]) -> i32 {
    let rank = fixture_bps.iter().filter(|b| **b > player_bps).count() + 1;
    match rank {
        1 => 3,
        2 => 2,
        3 => 1,
        _ => 0,
    }
}

/// Effective multiplier for a starting slot: upstream sometimes leaves the
/// captain at 1, so force 2 (or 3 under triple captain).
pub fn normalize_multiplier(pick: &PickSlot, chip: Option<Chip>) -> i32 {
    if pick.is_captain && pick.multiplier == 1 {
        if chip == Some(Chip::TripleCaptain) {
            3
        } else {
            2
        }
    } else {
        pick.multiplier.clamp(0, 3)
    }
}

/// Infer automatic substitutions from store state when upstream omits them.
///
/// For each starter with zero minutes whose fixtures are all done, walk the
/// bench in priority order and take the first unused candidate that played,
/// whose fixtures are done, and that is position-compatible: a goalkeeper is
/// only ever replaced by a goalkeeper, an outfield starter by any outfield
/// bench player.
pub fn infer_automatic_subs(picks: &[PickSlot], ctx: &PointsContext) -> Vec<AutomaticSub> {
    let mut bench: Vec<&PickSlot> = picks.iter().filter(|p| !p.is_starter()).collect();
    bench.sort_by_key(|p| p.position);

    let mut subs = Vec::new();
    let mut used_bench: HashSet<i64> = HashSet::new();

    for starter in picks.iter().filter(|p| p.is_starter()) {
        if !(ctx.fixtures(starter.player_id).all_done && ctx.minutes(starter.player_id) == 0) {
            continue;
        }
        let starter_is_gk = ctx
            .position(starter.player_id)
            .map(Position::is_goalkeeper)
            .unwrap_or(starter.position == 1);

        for candidate in &bench {
            if used_bench.contains(&candidate.player_id) {
                continue;
            }
            let candidate_is_gk = ctx
                .position(candidate.player_id)
                .map(Position::is_goalkeeper)
                .unwrap_or(candidate.position == 12);
            if starter_is_gk != candidate_is_gk {
                continue;
            }
            let outcome = ctx.fixtures(candidate.player_id);
            if outcome.all_done && ctx.minutes(candidate.player_id) > 0 {
                subs.push(AutomaticSub {
                    element_in: candidate.player_id,
                    element_out: starter.player_id,
                });
                used_bench.insert(candidate.player_id);
                break;
            }
        }
    }
    subs
}

/// Substitutions to apply: adopt upstream pairs whose out-player genuinely
/// finished on zero minutes, or infer from store state when upstream has none.
pub fn resolve_automatic_subs(
    picks: &[PickSlot],
    upstream_subs: &[AutomaticSub],
    ctx: &PointsContext,
) -> Vec<AutomaticSub> {
    if upstream_subs.is_empty() {
        return infer_automatic_subs(picks, ctx);
    }
    upstream_subs
        .iter()
        .filter(|sub| {
            ctx.fixtures(sub.element_out).all_done && ctx.minutes(sub.element_out) == 0
        })
        .copied()
        .collect()
}

/// Compute a manager's gameweek points.
///
/// Starters score `effective_points * multiplier` (captain normalized). A
/// starter that subbed out retains zero; its replacement contributes base
/// points at multiplier 1. Bench boost adds the bench at multiplier 1 and
/// disables substitutions (all fifteen already count). Transfer cost is
/// always subtracted and the result floors at zero.
pub fn compute_gameweek_points(
    picks: &[PickSlot],
    upstream_subs: &[AutomaticSub],
    ctx: &PointsContext,
    active_chip: Option<Chip>,
    transfer_cost: i32,
) -> GameweekPoints {
    let bench_boost = active_chip == Some(Chip::BenchBoost);
    let auto_subs = if bench_boost {
        Vec::new()
    } else {
        resolve_automatic_subs(picks, upstream_subs, ctx)
    };
    let subbed_out: HashSet<i64> = auto_subs.iter().map(|s| s.element_out).collect();

    let mut raw_points = 0;
    for pick in picks {
        if pick.is_starter() {
            if subbed_out.contains(&pick.player_id) {
                continue;
            }
            raw_points += ctx.effective_points(pick.player_id) * normalize_multiplier(pick, active_chip);
        } else if bench_boost {
            raw_points += ctx.effective_points(pick.player_id);
        }
    }
    for sub in &auto_subs {
        raw_points += ctx.effective_points(sub.element_in);
    }

    let transfer_cost = transfer_cost.max(0);
    GameweekPoints {
        raw_points,
        gameweek_points: (raw_points - transfer_cost).max(0),
        transfer_cost,
        auto_subs,
    }
}

/// Total points: baseline plus gameweek points when the baseline is set,
/// else previous gameweek's total plus gameweek points, else the gameweek
/// points alone.
pub fn resolve_total_points(
    baseline_total_points: Option<i32>,
    previous_total_points: Option<i32>,
    gameweek_points: i32,
) -> i32 {
    match (baseline_total_points, previous_total_points) {
        (Some(baseline), _) => baseline + gameweek_points,
        (None, Some(previous)) => previous + gameweek_points,
        (None, None) => gameweek_points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(player_id: i64, position: i32) -> PickSlot {
        PickSlot {
            player_id,
            position,
            multiplier: if position <= 11 { 1 } else { 0 },
            is_captain: false,
            is_vice_captain: false,
        }
    }

    fn player(
        minutes: i32,
        points: i32,
        done: bool,
        position: Position,
    ) -> PlayerGwInput {
        PlayerGwInput {
            minutes,
            effective_points: points,
            fixtures: FixtureOutcome {
                all_finished: done,
                all_done: done,
            },
            position: Some(position),
        }
    }

    /// Squad: GK1, DEF1-3, MID1-3, FWD1-4 starting; bench GK2, MID4, DEF4, MID5.
    fn squad() -> Vec<PickSlot> {
        let mut picks = vec![slot(1, 1)];
        picks.extend((2..=4).map(|i| slot(i, i as i32)));
        picks.extend((5..=7).map(|i| slot(i, i as i32)));
        picks.extend((8..=11).map(|i| slot(i, i as i32)));
        picks.push(slot(12, 12)); // GK2
        picks.push(slot(13, 13)); // MID4
        picks.push(slot(14, 14)); // DEF4
        picks.push(slot(15, 15)); // MID5
        picks
    }

    fn squad_ctx() -> PointsContext {
        let mut ctx = PointsContext::default();
        ctx.players.insert(1, player(90, 6, true, Position::Goalkeeper));
        for i in 2..=4 {
            ctx.players.insert(i, player(90, 2, true, Position::Defender));
        }
        for i in 5..=7 {
            ctx.players.insert(i, player(90, 3, true, Position::Midfielder));
        }
        for i in 8..=11 {
            ctx.players.insert(i, player(90, 4, true, Position::Forward));
        }
        ctx.players.insert(12, player(90, 1, true, Position::Goalkeeper));
        ctx.players.insert(13, player(90, 5, true, Position::Midfielder));
        ctx.players.insert(14, player(0, 0, true, Position::Defender));
        ctx.players.insert(15, player(90, 2, true, Position::Midfielder));
        ctx
    }

    #[test]
    fn auto_sub_inference_walks_bench_in_order_with_position_compat() {
        let picks = squad();
        let mut ctx = squad_ctx();
        // MID2 (player 6): 0 minutes, fixture finished.
        ctx.players.insert(6, player(0, 0, true, Position::Midfielder));

        let subs = infer_automatic_subs(&picks, &ctx);
        // GK2 skipped (position), MID4 selected, DEF4 skipped (0 minutes),
        // MID5 never reached.
        assert_eq!(
            subs,
            vec![AutomaticSub {
                element_in: 13,
                element_out: 6
            }]
        );
    }

    #[test]
    fn auto_sub_requires_finished_fixture() {
        let picks = squad();
        let mut ctx = squad_ctx();
        // 0 minutes but match still running: no substitution yet.
        ctx.players.insert(6, player(0, 0, false, Position::Midfielder));
        assert!(infer_automatic_subs(&picks, &ctx).is_empty());
    }

    #[test]
    fn goalkeeper_only_replaced_by_goalkeeper() {
        let picks = squad();
        let mut ctx = squad_ctx();
        ctx.players.insert(1, player(0, 0, true, Position::Goalkeeper));
        let subs = infer_automatic_subs(&picks, &ctx);
        assert_eq!(
            subs,
            vec![AutomaticSub {
                element_in: 12,
                element_out: 1
            }]
        );
    }

    #[test]
    fn each_bench_player_used_at_most_once() {
        let picks = squad();
        let mut ctx = squad_ctx();
        // Two midfield starters blank with finished fixtures.
        ctx.players.insert(5, player(0, 0, true, Position::Midfielder));
        ctx.players.insert(6, player(0, 0, true, Position::Midfielder));
        let subs = infer_automatic_subs(&picks, &ctx);
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].element_in, 13);
        // DEF4 has zero minutes, so the second sub reaches MID5.
        assert_eq!(subs[1].element_in, 15);
    }

    #[test]
    fn replacement_scores_base_points_and_outgoing_retains_zero() {
        let picks = squad();
        let mut ctx = squad_ctx();
        ctx.players.insert(6, player(0, 0, true, Position::Midfielder));

        let result = compute_gameweek_points(&picks, &[], &ctx, None, 0);
        // Starters minus MID2: GK 6 + DEF 3x2 + MID 2x3 + FWD 4x4 = 34, plus MID4's 5.
        assert_eq!(result.raw_points, 39);
        assert_eq!(result.auto_subs.len(), 1);
    }

    #[test]
    fn upstream_subs_adopted_only_when_out_player_finished_scoreless() {
        let picks = squad();
        let mut ctx = squad_ctx();
        ctx.players.insert(6, player(0, 0, true, Position::Midfielder));
        let upstream = vec![
            AutomaticSub {
                element_in: 13,
                element_out: 6,
            },
            // Bogus pair: player 5 played 90 minutes.
            AutomaticSub {
                element_in: 15,
                element_out: 5,
            },
        ];
        let resolved = resolve_automatic_subs(&picks, &upstream, &ctx);
        assert_eq!(
            resolved,
            vec![AutomaticSub {
                element_in: 13,
                element_out: 6
            }]
        );
    }

    #[test]
    fn captain_multiplier_normalizes_to_two_or_three() {
        let mut pick = slot(8, 8);
        pick.is_captain = true;
        pick.multiplier = 1;
        assert_eq!(normalize_multiplier(&pick, None), 2);
        assert_eq!(normalize_multiplier(&pick, Some(Chip::TripleCaptain)), 3);
        pick.multiplier = 2;
        assert_eq!(normalize_multiplier(&pick, None), 2);
    }

    #[test]
    fn provisional_bonus_ties_share_the_lower_rank() {
        let bps = [35, 30, 30, 25];
        assert_eq!(provisional_bonus(35, &bps), 3);
        assert_eq!(provisional_bonus(30, &bps), 2);
        assert_eq!(provisional_bonus(25, &bps), 0);
    }

    #[test]
    fn transfer_cost_floors_at_zero() {
        let picks = vec![slot(8, 1)];
        let mut ctx = PointsContext::default();
        ctx.players.insert(8, player(90, 3, true, Position::Forward));
        let result = compute_gameweek_points(&picks, &[], &ctx, None, 8);
        assert_eq!(result.raw_points, 3);
        assert_eq!(result.gameweek_points, 0);
    }

    #[test]
    fn bench_boost_counts_bench_at_multiplier_one() {
        let picks = squad();
        let ctx = squad_ctx();
        let without = compute_gameweek_points(&picks, &[], &ctx, None, 0);
        let with = compute_gameweek_points(&picks, &[], &ctx, Some(Chip::BenchBoost), 0);
        // Bench: 1 + 5 + 0 + 2 = 8 extra points.
        assert_eq!(with.raw_points, without.raw_points + 8);
        assert!(with.auto_subs.is_empty());
    }

    #[test]
    fn dgw_rows_sum_once_per_pick() {
        use crate::types::domain::{BonusStatus, PlayerGameweekStatsRow};
        let base = PlayerGameweekStatsRow {
            player_id: 8,
            gameweek_id: 20,
            fixture_id: Some(100),
            team_id: 1,
            opponent_team_id: Some(2),
            was_home: Some(true),
            kickoff_at: None,
            minutes: 90,
            total_points: 6,
            bps: 20,
            bonus: 0,
            bonus_status: BonusStatus::Provisional,
            provisional_bonus: 0,
            goals: 1,
            assists: 0,
            own_goals: 0,
            penalties_saved: 0,
            penalties_missed: 0,
            saves: 0,
            clean_sheets: 0,
            goals_conceded: 1,
            yellow_cards: 0,
            red_cards: 0,
            defensive_contribution: 0,
            expected_goals: 0.0,
            expected_assists: 0.0,
            expected_goal_involvements: 0.0,
            expected_goals_conceded: 0.0,
            influence: 0.0,
            creativity: 0.0,
            threat: 0.0,
            ict_index: 0.0,
            home_score: Some(2),
            away_score: Some(1),
            match_finished: true,
            match_finished_provisional: true,
        };
        let second = PlayerGameweekStatsRow {
            fixture_id: Some(101),
            total_points: 9,
            ..base.clone()
        };
        let input =
            PlayerGwInput::from_stats_rows(&[&base, &second], Some(Position::Forward));
        assert_eq!(input.effective_points, 15);
        assert_eq!(input.minutes, 180);

        // Captain on a DGW: sum(fixture_points) * multiplier, not per row.
        let mut pick = slot(8, 1);
        pick.is_captain = true;
        let mut ctx = PointsContext::default();
        ctx.players.insert(8, input);
        let result = compute_gameweek_points(&[pick], &[], &ctx, None, 0);
        assert_eq!(result.raw_points, 30);
    }

    #[test]
    fn total_points_resolution_prefers_baseline() {
        assert_eq!(resolve_total_points(Some(100), Some(90), 7), 107);
        assert_eq!(resolve_total_points(None, Some(90), 7), 97);
        assert_eq!(resolve_total_points(None, None, 7), 7);
    }
}
