mod common;

use arena_netcore::config::SimulationConfig;
use arena_netcore::game::flow::{KillFeed, RoundResult};
use arena_netcore::game::sim::ENVIRONMENT_ID;
use arena_netcore::game::sim::SimulationStep;
use arena_netcore::game::{ConnectionState, Control, MatchPhase, SessionEvent};

use common::{Table, STEP_MS};

fn round_results(events: &[SessionEvent]) -> Vec<RoundResult> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::RoundResult(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

fn kills(events: &[SessionEvent]) -> Vec<KillFeed> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Kill(k) => Some(k.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn two_players_play_a_round() {
    let mut table = Table::open(SimulationConfig::default(), &["Host", "Guest"], 11);
    let (host, guest) = (table.id(0), table.id(1));

    table.seats[0].request_start(table.now).unwrap();
    table.advance(STEP_MS);
    assert_eq!(table.seats[1].match_state().phase, MatchPhase::Countdown);

    table.run_until(0, MatchPhase::Playing, 3_500);
    table.advance(STEP_MS * 2);
    assert_eq!(table.seats[1].match_state().phase, MatchPhase::Playing);
    assert!(table.seats[0].simulation().has_ship(&guest));
    table.take_events(0);
    table.take_events(1);

    table.crush(0, &guest);
    table.advance(STEP_MS * 4);

    let host_events = table.take_events(0);
    let results = round_results(&host_events);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].winner_id.as_deref(), Some(host.as_str()));
    assert!(!results[0].is_tie);
    assert_eq!(results[0].round_number, 1);

    let feed = kills(&host_events);
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].victim_id, guest);
    assert_eq!(feed[0].killer_id, ENVIRONMENT_ID);

    let registry = table.seats[0].registry();
    assert_eq!(registry.get(&host).unwrap().round_wins, 1);
    assert_eq!(registry.get(&host).unwrap().kills, 0);
    assert_eq!(registry.get(&guest).unwrap().connection_state, ConnectionState::Ejected);
    assert_eq!(table.seats[0].match_state().phase, MatchPhase::RoundEnd);

    // The guest hears about it through the reliable channel
    let guest_events = table.take_events(1);
    assert_eq!(round_results(&guest_events).len(), 1);
    assert_eq!(table.seats[1].match_state().phase, MatchPhase::RoundEnd);
    assert_eq!(table.seats[1].registry().get(&host).unwrap().round_wins, 1);
}

#[test]
fn first_to_three_ends_the_game() {
    let mut table = Table::open(SimulationConfig::default(), &["Host", "Guest"], 12);
    let (host, guest) = (table.id(0), table.id(1));

    table.seats[0].request_start(table.now).unwrap();
    for round in 1..=3 {
        table.run_until(0, MatchPhase::Playing, 7_000);
        assert_eq!(table.seats[0].match_state().current_round, round);
        table.crush(0, &guest);
        table.advance(STEP_MS * 4);
    }

    assert_eq!(table.seats[0].match_state().phase, MatchPhase::GameEnd);
    assert_eq!(table.seats[0].pending_timers(), 0);
    assert_eq!(table.seats[0].registry().get(&host).unwrap().round_wins, 3);

    let over: Vec<_> = table
        .take_events(1)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::GameOver(over) => Some(over),
            _ => None,
        })
        .collect();
    assert_eq!(over.len(), 1);
    assert_eq!(over[0].winner_id.as_deref(), Some(host.as_str()));
    assert_eq!(over[0].winner_name.as_deref(), Some("Host"));

    // Stays over until someone restarts
    table.advance(5_000);
    assert_eq!(table.seats[0].match_state().phase, MatchPhase::GameEnd);

    table.seats[1].request_restart().unwrap();
    table.advance(STEP_MS * 2);
    assert_eq!(table.seats[0].match_state().phase, MatchPhase::Lobby);
    assert_eq!(table.seats[0].match_state().current_round, 0);
    assert_eq!(table.seats[0].registry().get(&host).unwrap().round_wins, 0);
    assert_eq!(table.seats[1].match_state().phase, MatchPhase::Lobby);
}

#[test]
fn late_joiner_restarts_countdown() {
    let mut table = Table::open(SimulationConfig::default(), &["Host", "Guest"], 13);
    let code = table.code();

    let started = table.now;
    table.seats[0].request_start(started).unwrap();
    table.advance(1_500);
    table.take_events(0);

    let late = table.join(&code, "Late");
    let late_id = table.id(late);

    let restarts = table
        .take_events(0)
        .iter()
        .filter(|e| matches!(e, SessionEvent::Countdown(tick) if tick.value == 3))
        .count();
    assert_eq!(restarts, 1);

    // The original countdown would have finished by now
    table.advance(started + 3_100 - table.now);
    assert_eq!(table.seats[0].match_state().phase, MatchPhase::Countdown);
    assert!(table.seats[0].simulation().has_ship(&late_id));

    table.run_until(0, MatchPhase::Playing, 3_500);
    let playing = table
        .take_events(0)
        .iter()
        .filter(|e| matches!(e, SessionEvent::PhaseChanged(s) if s.phase == MatchPhase::Playing))
        .count();
    assert_eq!(playing, 1);
    assert_eq!(
        table.seats[0].registry().get(&late_id).unwrap().connection_state,
        ConnectionState::Active
    );
}

#[test]
fn joiner_during_play_spectates_until_next_round() {
    let mut table = Table::open(SimulationConfig::default(), &["Host", "Guest"], 14);
    let code = table.code();
    let guest = table.id(1);

    table.seats[0].request_start(table.now).unwrap();
    table.run_until(0, MatchPhase::Playing, 3_500);

    let late = table.join(&code, "Late");
    let late_id = table.id(late);
    assert_eq!(
        table.seats[0].registry().get(&late_id).unwrap().connection_state,
        ConnectionState::Spectating
    );
    assert!(!table.seats[0].simulation().has_ship(&late_id));
    assert_eq!(table.seats[late].match_state().phase, MatchPhase::Playing);

    table.crush(0, &guest);
    table.run_until(0, MatchPhase::Countdown, 4_000);
    assert_eq!(
        table.seats[0].registry().get(&late_id).unwrap().connection_state,
        ConnectionState::Active
    );
    assert!(table.seats[0].simulation().has_ship(&late_id));
}

#[test]
fn bots_fill_a_match() {
    let mut table = Table::open(SimulationConfig::default(), &["Solo"], 15);
    let bot = table.seats[0]
        .add_bot(Control::AiBot, table.now)
        .unwrap()
        .expect("authority adds bots directly");
    assert_eq!(bot, "bot-1");

    table.seats[0].request_start(table.now).unwrap();
    table.run_until(0, MatchPhase::Playing, 3_500);

    let bot_ship = |table: &Table| {
        table.seats[0]
            .simulation()
            .capture()
            .ships
            .into_iter()
            .find(|s| s.owner_id.as_deref() == Some(bot.as_str()))
            .map(|s| (s.x, s.y))
    };
    let spawn = bot_ship(&table).expect("bot spawned");
    table.advance(1_000);
    // The bot either flew off or got shot down
    assert_ne!(bot_ship(&table), Some(spawn));
}
