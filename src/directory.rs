//! The authoritative map of users and channels: the invariants that tie
//! connections, channels, and membership together live here.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use log::info;

use crate::error::DirectoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Member {
    pub muted: bool,
    pub operator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegState {
    Init,
    HaveNick,
    HaveUser,
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: u64,
    pub nick: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub peer_ipv4: Ipv4Addr,
    pub channel: Option<String>,
    pub state: RegState,
}

impl UserRecord {
    fn new(id: u64, peer_ipv4: Ipv4Addr) -> Self {
        Self {
            id,
            nick: None,
            username: None,
            realname: None,
            peer_ipv4,
            channel: None,
            state: RegState::Init,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub members: HashMap<u64, Member>,
}

impl Channel {
    fn new(name: String, founder: u64) -> Self {
        let mut members = HashMap::new();
        members.insert(
            founder,
            Member {
                muted: false,
                operator: true,
            },
        );
        Self { name, members }
    }

    pub fn has_operator(&self) -> bool {
        self.members.values().any(|m| m.operator)
    }
}

#[derive(Default)]
pub struct Directory {
    users: HashMap<u64, UserRecord>,
    channels: HashMap<String, Channel>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_connection(&mut self, id: u64, peer_ipv4: Ipv4Addr) {
        self.users.insert(id, UserRecord::new(id, peer_ipv4));
    }

    pub fn remove_connection(&mut self, id: u64) -> Result<(), DirectoryError> {
        if let Some(user) = self.users.get(&id) {
            if user.channel.is_some() {
                return Err(DirectoryError::InvariantViolated(format!(
                    "connection {id} removed while still a channel member"
                )));
            }
        }
        self.users.remove(&id);
        Ok(())
    }

    pub fn user(&self, id: u64) -> Option<&UserRecord> {
        self.users.get(&id)
    }

    pub fn user_mut(&mut self, id: u64) -> Option<&mut UserRecord> {
        self.users.get_mut(&id)
    }

    pub fn user_by_nick(&self, nick: &str) -> Option<&UserRecord> {
        self.users
            .values()
            .find(|u| u.nick.as_deref() == Some(nick))
    }

    pub fn nick_in_use(&self, nick: &str) -> bool {
        self.user_by_nick(nick).is_some()
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(name)
    }

    pub fn member(&self, channel: &str, id: u64) -> Option<&Member> {
        self.channels.get(channel)?.members.get(&id)
    }

    /// Joins `id` to `name`, creating the channel (with `id` as its first
    /// operator) if it does not yet exist. The caller must ensure `id` is
    /// not currently a member of another channel.
    pub fn join(&mut self, id: u64, name: &str) -> Result<(), DirectoryError> {
        if let Some(user) = self.users.get(&id) {
            if user.channel.is_some() {
                return Err(DirectoryError::AlreadyInChannel(id));
            }
        }
        match self.channels.get_mut(name) {
            Some(channel) => {
                channel.members.insert(
                    id,
                    Member {
                        muted: false,
                        operator: false,
                    },
                );
            }
            None => {
                self.channels
                    .insert(name.to_string(), Channel::new(name.to_string(), id));
                info!("channel {name} created");
            }
        }
        if let Some(user) = self.users.get_mut(&id) {
            user.channel = Some(name.to_string());
        }
        Ok(())
    }

    /// Removes `id`'s membership from `name`. Destroys the channel if it
    /// becomes empty; otherwise promotes an arbitrary remaining member to
    /// operator if the departure left none. Returns the promoted id, if
    /// any.
    pub fn quit_channel(&mut self, id: u64, name: &str) -> Result<Option<u64>, DirectoryError> {
        let channel = self
            .channels
            .get_mut(name)
            .ok_or_else(|| DirectoryError::NoSuchChannel(name.to_string()))?;
        if channel.members.remove(&id).is_none() {
            return Err(DirectoryError::NotOnChannel(id, name.to_string()));
        }

        let mut promoted = None;
        if channel.members.is_empty() {
            self.channels.remove(name);
            info!("channel {name} destroyed (empty)");
        } else if !channel.has_operator() {
            let next = *channel.members.keys().next().unwrap();
            channel.members.get_mut(&next).unwrap().operator = true;
            promoted = Some(next);
            info!("connection {next} promoted to operator of {name}");
        }

        if let Some(user) = self.users.get_mut(&id) {
            user.channel = None;
        }
        Ok(promoted)
    }

    pub fn mute(&mut self, channel: &str, id: u64) -> bool {
        self.set_muted(channel, id, true)
    }

    pub fn unmute(&mut self, channel: &str, id: u64) -> bool {
        self.set_muted(channel, id, false)
    }

    fn set_muted(&mut self, channel: &str, id: u64, muted: bool) -> bool {
        match self.channels.get_mut(channel).and_then(|c| c.members.get_mut(&id)) {
            Some(member) => {
                member.muted = muted;
                true
            }
            None => false,
        }
    }

    /// Validates the invariants in §3/§8 against current state. Intended
    /// for tests and as a defensive check after a dispatch.
    pub fn check_invariants(&self) -> Result<(), DirectoryError> {
        for channel in self.channels.values() {
            if channel.members.is_empty() {
                return Err(DirectoryError::InvariantViolated(format!(
                    "channel {} has no members",
                    channel.name
                )));
            }
            if !channel.has_operator() {
                return Err(DirectoryError::InvariantViolated(format!(
                    "channel {} has no operator",
                    channel.name
                )));
            }
        }
        for user in self.users.values() {
            if let Some(name) = &user.channel {
                let channel = self
                    .channels
                    .get(name)
                    .ok_or_else(|| DirectoryError::NoSuchChannel(name.clone()))?;
                if !channel.members.contains_key(&user.id) {
                    return Err(DirectoryError::InvariantViolated(format!(
                        "user {} believes it is in {} but is not a member",
                        user.id, name
                    )));
                }
            }
        }
        let mut seen_nicks = std::collections::HashSet::new();
        for user in self.users.values() {
            if let Some(nick) = &user.nick {
                if !seen_nicks.insert(nick) {
                    return Err(DirectoryError::InvariantViolated(format!(
                        "duplicate nick {nick}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Ipv4Addr {
        Ipv4Addr::new(127, 0, 0, 1)
    }

    #[test]
    fn join_creates_channel_with_founder_as_operator() {
        let mut dir = Directory::new();
        dir.register_connection(1, addr());
        dir.join(1, "#room").unwrap();
        let member = dir.member("#room", 1).unwrap();
        assert!(member.operator);
        assert!(!member.muted);
        assert_eq!(dir.user(1).unwrap().channel.as_deref(), Some("#room"));
    }

    #[test]
    fn second_joiner_is_not_operator() {
        let mut dir = Directory::new();
        dir.register_connection(1, addr());
        dir.register_connection(2, addr());
        dir.join(1, "#room").unwrap();
        dir.join(2, "#room").unwrap();
        assert!(!dir.member("#room", 2).unwrap().operator);
    }

    #[test]
    fn quit_last_member_destroys_channel() {
        let mut dir = Directory::new();
        dir.register_connection(1, addr());
        dir.join(1, "#room").unwrap();
        let promoted = dir.quit_channel(1, "#room").unwrap();
        assert_eq!(promoted, None);
        assert!(dir.channel("#room").is_none());
    }

    #[test]
    fn quit_by_operator_promotes_remaining_member() {
        let mut dir = Directory::new();
        dir.register_connection(1, addr());
        dir.register_connection(2, addr());
        dir.join(1, "#room").unwrap();
        dir.join(2, "#room").unwrap();
        let promoted = dir.quit_channel(1, "#room").unwrap();
        assert_eq!(promoted, Some(2));
        assert!(dir.member("#room", 2).unwrap().operator);
    }

    #[test]
    fn join_while_already_in_a_channel_is_rejected() {
        let mut dir = Directory::new();
        dir.register_connection(1, addr());
        dir.join(1, "#room").unwrap();
        let err = dir.join(1, "#other").unwrap_err();
        assert_eq!(err, DirectoryError::AlreadyInChannel(1));
    }

    #[test]
    fn invariants_hold_through_promotion_sequence() {
        let mut dir = Directory::new();
        dir.register_connection(1, addr());
        dir.register_connection(2, addr());
        dir.register_connection(3, addr());
        dir.join(1, "#room").unwrap();
        dir.join(2, "#room").unwrap();
        dir.join(3, "#room").unwrap();
        dir.check_invariants().unwrap();
        dir.quit_channel(1, "#room").unwrap();
        dir.check_invariants().unwrap();
    }

    #[test]
    fn remove_connection_while_in_channel_is_rejected() {
        let mut dir = Directory::new();
        dir.register_connection(1, addr());
        dir.join(1, "#room").unwrap();
        let err = dir.remove_connection(1).unwrap_err();
        assert!(matches!(err, DirectoryError::InvariantViolated(_)));
    }
}
