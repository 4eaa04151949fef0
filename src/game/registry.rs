//! Player registry: authoritative on the host, a read-only mirror elsewhere

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::transport::{PeerId, PeerInfo};

use super::PlayerId;

/// How a player's input is produced, from the point of view of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlKind {
    Local,
    Remote,
    AiBot,
    LocalBot,
}

/// Who drives a player, independent of viewpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Control {
    Human,
    AiBot,
    /// Extra controller on the owner's device
    LocalBot { slot: u8 },
}

impl Control {
    pub fn slot(&self) -> u8 {
        match self {
            Control::LocalBot { slot } => *slot,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Taking part in the current round
    Active,
    /// Knocked out of the current round
    Ejected,
    /// Waiting for the next round
    Spectating,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub display_name: String,
    pub color_index: u8,
    pub kills: u32,
    pub round_wins: u32,
    pub control: Control,
    /// Peer whose device or process drives this player
    pub owner: PeerId,
    pub connection_state: ConnectionState,
}

impl PlayerRecord {
    pub fn control_kind(&self, local_peer: &str) -> ControlKind {
        let mine = self.owner == local_peer;
        match self.control {
            Control::Human if mine => ControlKind::Local,
            Control::Human => ControlKind::Remote,
            Control::AiBot => ControlKind::AiBot,
            Control::LocalBot { .. } if mine => ControlKind::LocalBot,
            Control::LocalBot { .. } => ControlKind::Remote,
        }
    }

    pub fn is_active(&self) -> bool {
        self.connection_state == ConnectionState::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMode {
    /// Sole writer of scores and connection state
    Authoritative,
    /// Copies whatever the authority last published
    Mirror,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry is a mirror; only the authority may write")]
    NotAuthoritative,

    #[error("No free player slot")]
    Full,

    #[error("Unknown player: {0}")]
    UnknownPlayer(String),
}

pub struct PlayerRegistry {
    mode: RegistryMode,
    palette_size: usize,
    players: Vec<PlayerRecord>,
    bot_counter: u32,
    dirty: bool,
}

impl PlayerRegistry {
    pub fn authoritative(palette_size: usize) -> Self {
        Self::with_mode(RegistryMode::Authoritative, palette_size)
    }

    pub fn mirror(palette_size: usize) -> Self {
        Self::with_mode(RegistryMode::Mirror, palette_size)
    }

    fn with_mode(mode: RegistryMode, palette_size: usize) -> Self {
        Self {
            mode,
            palette_size,
            players: Vec::new(),
            bot_counter: 0,
            dirty: false,
        }
    }

    /// Take over authority using the last published roster
    pub fn rebuild_authoritative(palette_size: usize, roster: Vec<PlayerRecord>) -> Self {
        let bot_counter = roster
            .iter()
            .filter_map(|p| p.id.strip_prefix("bot-"))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        Self {
            mode: RegistryMode::Authoritative,
            palette_size,
            players: roster,
            bot_counter,
            dirty: true,
        }
    }

    pub fn mode(&self) -> RegistryMode {
        self.mode
    }

    fn ensure_authoritative(&self) -> Result<(), RegistryError> {
        match self.mode {
            RegistryMode::Authoritative => Ok(()),
            RegistryMode::Mirror => Err(RegistryError::NotAuthoritative),
        }
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut PlayerRecord, RegistryError> {
        self.players
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| RegistryError::UnknownPlayer(id.to_string()))
    }

    fn free_color(&self) -> Option<u8> {
        (0..self.palette_size as u8).find(|c| !self.players.iter().any(|p| p.color_index == *c))
    }

    /// Add a player. Joining twice is a no-op.
    pub fn add(
        &mut self,
        id: &str,
        display_name: &str,
        control: Control,
        owner: &str,
        state: ConnectionState,
    ) -> Result<&PlayerRecord, RegistryError> {
        self.ensure_authoritative()?;
        if let Some(pos) = self.players.iter().position(|p| p.id == id) {
            debug!(player_id = %id, "Duplicate join ignored");
            return Ok(&self.players[pos]);
        }
        let color_index = self.free_color().ok_or(RegistryError::Full)?;
        self.players.push(PlayerRecord {
            id: id.to_string(),
            display_name: display_name.to_string(),
            color_index,
            kills: 0,
            round_wins: 0,
            control,
            owner: owner.to_string(),
            connection_state: state,
        });
        self.dirty = true;
        info!(player_id = %id, color_index, "Player registered");
        Ok(&self.players[self.players.len() - 1])
    }

    pub fn add_human(
        &mut self,
        peer: &PeerInfo,
        state: ConnectionState,
    ) -> Result<&PlayerRecord, RegistryError> {
        self.add(&peer.id, &peer.display_name, Control::Human, &peer.id, state)
    }

    /// Add a bot driven by `owner`, returning its id
    pub fn add_bot(
        &mut self,
        owner: &str,
        control: Control,
        state: ConnectionState,
    ) -> Result<PlayerId, RegistryError> {
        self.ensure_authoritative()?;
        if self.free_color().is_none() {
            return Err(RegistryError::Full);
        }
        self.bot_counter += 1;
        let id = format!("bot-{}", self.bot_counter);
        let name = match control {
            Control::LocalBot { slot } => format!("Player {}", slot + 1),
            _ => format!("Bot {}", self.bot_counter),
        };
        self.add(&id, &name, control, owner, state)?;
        Ok(id)
    }

    /// Remove a player, freeing its color
    pub fn remove(&mut self, id: &str) -> Result<Option<PlayerRecord>, RegistryError> {
        self.ensure_authoritative()?;
        let removed = self
            .players
            .iter()
            .position(|p| p.id == id)
            .map(|pos| self.players.remove(pos));
        if removed.is_some() {
            self.dirty = true;
        }
        Ok(removed)
    }

    /// Drop every human or local bot a departed peer was driving and hand
    /// its AI bots to `new_owner`
    pub fn reconcile_departed(
        &mut self,
        departed: &str,
        new_owner: &str,
    ) -> Result<Vec<PlayerRecord>, RegistryError> {
        self.ensure_authoritative()?;
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.players)
            .into_iter()
            .partition(|p| p.owner == departed && p.control != Control::AiBot);
        self.players = kept;
        for bot in self.players.iter_mut().filter(|p| p.owner == departed) {
            bot.owner = new_owner.to_string();
        }
        self.dirty = true;
        Ok(removed)
    }

    pub fn set_state(&mut self, id: &str, state: ConnectionState) -> Result<(), RegistryError> {
        self.ensure_authoritative()?;
        let record = self.get_mut(id)?;
        if record.connection_state != state {
            record.connection_state = state;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn credit_kill(&mut self, id: &str) -> Result<u32, RegistryError> {
        self.ensure_authoritative()?;
        let record = self.get_mut(id)?;
        record.kills += 1;
        let kills = record.kills;
        self.dirty = true;
        Ok(kills)
    }

    /// Increment a player's round wins, returning the new total
    pub fn award_round(&mut self, id: &str) -> Result<u32, RegistryError> {
        self.ensure_authoritative()?;
        let record = self.get_mut(id)?;
        record.round_wins += 1;
        let wins = record.round_wins;
        self.dirty = true;
        Ok(wins)
    }

    /// Zero kills and round wins for everyone
    pub fn reset_scores(&mut self) -> Result<(), RegistryError> {
        self.ensure_authoritative()?;
        for p in &mut self.players {
            p.kills = 0;
            p.round_wins = 0;
        }
        self.dirty = true;
        Ok(())
    }

    /// Bring everyone (ejected and spectating alike) into the next round
    pub fn activate_all(&mut self) -> Result<(), RegistryError> {
        self.ensure_authoritative()?;
        for p in &mut self.players {
            p.connection_state = ConnectionState::Active;
        }
        self.dirty = true;
        Ok(())
    }

    /// Replace the mirror with the authority's latest roster
    pub fn mirror_from(&mut self, roster: Vec<PlayerRecord>) -> Result<(), RegistryError> {
        if self.mode != RegistryMode::Mirror {
            return Err(RegistryError::NotAuthoritative);
        }
        self.players = roster;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&PlayerRecord> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerRecord> {
        self.players.iter()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn active_ids(&self) -> Vec<PlayerId> {
        self.players
            .iter()
            .filter(|p| p.is_active())
            .map(|p| p.id.clone())
            .collect()
    }

    /// Players taking part in the current round, eliminated or not
    pub fn participant_count(&self) -> usize {
        self.players
            .iter()
            .filter(|p| p.connection_state != ConnectionState::Spectating)
            .count()
    }

    pub fn round_wins_by_id(&self) -> BTreeMap<PlayerId, u32> {
        self.players
            .iter()
            .map(|p| (p.id.clone(), p.round_wins))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PlayerRecord> {
        self.players.clone()
    }

    /// Whether the roster changed since the last call
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            display_name: format!("Pilot {}", id),
        }
    }

    #[test]
    fn colors_are_unique_and_reused() {
        let mut reg = PlayerRegistry::authoritative(8);
        reg.add_human(&peer("a"), ConnectionState::Active).unwrap();
        reg.add_human(&peer("b"), ConnectionState::Active).unwrap();
        reg.add_human(&peer("c"), ConnectionState::Active).unwrap();
        assert_eq!(reg.get("b").unwrap().color_index, 1);

        reg.remove("b").unwrap();
        let d = reg.add_human(&peer("d"), ConnectionState::Active).unwrap();
        assert_eq!(d.color_index, 1);
    }

    #[test]
    fn duplicate_join_is_idempotent() {
        let mut reg = PlayerRegistry::authoritative(8);
        reg.add_human(&peer("a"), ConnectionState::Active).unwrap();
        reg.add_human(&peer("a"), ConnectionState::Spectating).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("a").unwrap().connection_state, ConnectionState::Active);
    }

    #[test]
    fn palette_exhaustion_is_full() {
        let mut reg = PlayerRegistry::authoritative(2);
        reg.add_human(&peer("a"), ConnectionState::Active).unwrap();
        reg.add_bot("a", Control::AiBot, ConnectionState::Active).unwrap();
        assert_eq!(
            reg.add_human(&peer("c"), ConnectionState::Active).unwrap_err(),
            RegistryError::Full
        );
    }

    #[test]
    fn mirror_rejects_writes() {
        let mut reg = PlayerRegistry::mirror(8);
        assert_eq!(
            reg.add_human(&peer("a"), ConnectionState::Active).unwrap_err(),
            RegistryError::NotAuthoritative
        );
        assert_eq!(reg.award_round("a").unwrap_err(), RegistryError::NotAuthoritative);
        assert_eq!(reg.credit_kill("a").unwrap_err(), RegistryError::NotAuthoritative);
    }

    #[test]
    fn mirror_copies_authority_values() {
        let mut host = PlayerRegistry::authoritative(8);
        host.add_human(&peer("a"), ConnectionState::Active).unwrap();
        host.award_round("a").unwrap();

        let mut mirror = PlayerRegistry::mirror(8);
        mirror.mirror_from(host.snapshot()).unwrap();
        assert_eq!(mirror.get("a").unwrap().round_wins, 1);
    }

    #[test]
    fn control_kind_depends_on_viewer() {
        let mut reg = PlayerRegistry::authoritative(8);
        reg.add_human(&peer("host"), ConnectionState::Active).unwrap();
        let bot = reg.add_bot("host", Control::AiBot, ConnectionState::Active).unwrap();
        let pad = reg
            .add_bot("host", Control::LocalBot { slot: 1 }, ConnectionState::Active)
            .unwrap();

        let rec = reg.get("host").unwrap();
        assert_eq!(rec.control_kind("host"), ControlKind::Local);
        assert_eq!(rec.control_kind("guest"), ControlKind::Remote);
        assert_eq!(reg.get(&bot).unwrap().control_kind("guest"), ControlKind::AiBot);
        assert_eq!(reg.get(&pad).unwrap().control_kind("host"), ControlKind::LocalBot);
        assert_eq!(reg.get(&pad).unwrap().display_name, "Player 2");
    }

    #[test]
    fn reconcile_departed_host() {
        let mut reg = PlayerRegistry::authoritative(8);
        reg.add_human(&peer("old"), ConnectionState::Active).unwrap();
        reg.add_human(&peer("new"), ConnectionState::Active).unwrap();
        let bot = reg.add_bot("old", Control::AiBot, ConnectionState::Active).unwrap();
        reg.add_bot("old", Control::LocalBot { slot: 1 }, ConnectionState::Active)
            .unwrap();

        let removed = reg.reconcile_departed("old", "new").unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(&bot).unwrap().owner, "new");
    }

    #[test]
    fn rebuild_continues_bot_numbering() {
        let mut reg = PlayerRegistry::authoritative(8);
        reg.add_bot("h", Control::AiBot, ConnectionState::Active).unwrap();
        reg.add_bot("h", Control::AiBot, ConnectionState::Active).unwrap();
        let mut rebuilt = PlayerRegistry::rebuild_authoritative(8, reg.snapshot());
        let id = rebuilt.add_bot("h", Control::AiBot, ConnectionState::Active).unwrap();
        assert_eq!(id, "bot-3");
    }

    #[test]
    fn reset_scores_zeroes_everything() {
        let mut reg = PlayerRegistry::authoritative(8);
        reg.add_human(&peer("a"), ConnectionState::Active).unwrap();
        reg.award_round("a").unwrap();
        reg.credit_kill("a").unwrap();
        reg.reset_scores().unwrap();
        assert!(reg.round_wins_by_id().values().all(|w| *w == 0));
        assert_eq!(reg.get("a").unwrap().kills, 0);
    }
}
