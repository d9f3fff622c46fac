//! The top-level state machine: accept loop, registration sequencing,
//! per-command dispatch, and the reap pass for disconnected connections.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::Interest;

use crate::codec::{
    format_numeric, format_system_privmsg, format_user_privmsg, Message, Numeric,
    CURRENT_CHANNEL_TARGET,
};
use crate::config::Config;
use crate::connection::Connection;
use crate::directory::{Directory, RegState};
use crate::error::ServerError;
use crate::poll::{PollOutcome, PollRegistry, LISTENER_TOKEN};
use crate::stream::ByteStream;

pub struct Server {
    config: Config,
    poll: PollRegistry,
    listener: TcpListener,
    directory: Directory,
    connections: HashMap<u64, Connection>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", config.network.bind_address, config.network.port)
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid listen address: {e}")))?;
        let mut listener = TcpListener::bind(addr).map_err(ServerError::Bind)?;
        let mut poll = PollRegistry::new().map_err(ServerError::Poll)?;
        poll.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Poll)?;

        Ok(Self {
            config,
            poll,
            listener,
            directory: Directory::new(),
            connections: HashMap::new(),
        })
    }

    /// Runs the event loop until SIGINT or a server-fatal error.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            match self.poll.poll_and_dispatch(Some(Duration::from_secs(1))) {
                Ok(PollOutcome::Shutdown) => {
                    info!("shutdown signal received");
                    return Ok(());
                }
                Ok(PollOutcome::Ready) => {}
                Err(e) => return Err(ServerError::Poll(e)),
            }

            let tokens: Vec<(mio::Token, bool, bool)> = self
                .poll
                .events()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in tokens {
                if token == LISTENER_TOKEN {
                    if readable {
                        self.accept_loop();
                    }
                    continue;
                }
                let id = token.0 as u64;
                if readable {
                    self.service_readable(id);
                }
                if writable {
                    if let Some(conn) = self.connections.get_mut(&id) {
                        if let Err(e) = conn.poll_send(&self.poll) {
                            warn!("connection {id} write error: {e}");
                            conn.connected = false;
                        }
                    }
                }
            }

            self.reap();
        }
    }

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let token = self.poll.next_token();
                    let id = token.0 as u64;
                    let mut conn = Connection::new(
                        id,
                        token,
                        ByteStream::new(stream),
                        self.config.limits.max_send_queue,
                    );
                    if let Err(e) = conn.register(&self.poll) {
                        error!("failed to register connection {id}: {e}");
                        continue;
                    }
                    let peer_ipv4 = conn.peer_ipv4().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
                    self.directory.register_connection(id, peer_ipv4);
                    info!("connection {id} accepted from {addr}");
                    self.connections.insert(id, conn);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn service_readable(&mut self, id: u64) {
        let lines = match self.connections.get_mut(&id) {
            Some(conn) => match conn.poll_recv() {
                Ok(lines) => lines,
                Err(e) => {
                    warn!("connection {id} read error: {e}");
                    if let Some(conn) = self.connections.get_mut(&id) {
                        conn.connected = false;
                    }
                    return;
                }
            },
            None => return,
        };
        for line in lines {
            self.dispatch(id, &line);
            if !self.connections.get(&id).map(|c| c.connected).unwrap_or(false) {
                break;
            }
        }
    }

    fn reap(&mut self) {
        let disconnected: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, c)| !c.connected)
            .map(|(id, _)| *id)
            .collect();

        for id in disconnected {
            if let Some(channel) = self.directory.user(id).and_then(|u| u.channel.clone()) {
                self.announce_and_quit(id, &channel, "quit");
            }
            if let Err(e) = self.directory.remove_connection(id) {
                error!("directory invariant violated reaping {id}: {e}");
            }
            if let Some(mut conn) = self.connections.remove(&id) {
                conn.disconnect(&self.poll);
            }
            info!("connection {id} reaped");
        }
    }

    fn send_to(&mut self, id: u64, line: &str) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if let Err(e) = conn.send_message(line, &self.poll) {
                warn!("connection {id} send error: {e}");
                conn.connected = false;
            }
        }
    }

    fn broadcast(&mut self, channel: &str, line: &str) {
        let Some(ids): Option<Vec<u64>> = self
            .directory
            .channel(channel)
            .map(|c| c.members.keys().copied().collect())
        else {
            return;
        };
        for id in ids {
            self.send_to(id, line);
        }
    }

    /// Removes `id` from `channel`, broadcasting `verb` and, if a
    /// promotion occurred, the promotion announcement.
    fn announce_and_quit(&mut self, id: u64, channel: &str, verb: &str) {
        let nick = self
            .directory
            .user(id)
            .and_then(|u| u.nick.clone())
            .unwrap_or_else(|| format!("user{id}"));
        self.broadcast(channel, &format_user_privmsg(&nick, channel, &format!("{nick} {verb}")));
        match self.directory.quit_channel(id, channel) {
            Ok(Some(promoted)) => {
                let promoted_nick = self
                    .directory
                    .user(promoted)
                    .and_then(|u| u.nick.clone())
                    .unwrap_or_else(|| format!("user{promoted}"));
                self.broadcast(
                    channel,
                    &format_system_privmsg(channel, &format!("{promoted_nick} promoted to operator")),
                );
            }
            Ok(None) => {}
            Err(e) => error!("quit_channel({id}, {channel}) failed: {e}"),
        }
    }

    fn resolve_target_channel(&self, id: u64, target: &str) -> Result<String, Numeric> {
        if target == CURRENT_CHANNEL_TARGET {
            self.directory
                .user(id)
                .and_then(|u| u.channel.clone())
                .ok_or(Numeric::ErrNotOnChannel)
        } else {
            Ok(target.to_string())
        }
    }

    fn valid_channel_name(&self, name: &str) -> bool {
        let first_ok = name.starts_with('#') || name.starts_with('&');
        first_ok
            && !name.contains(',')
            && !name.is_empty()
            && name.len() <= self.config.limits.max_channel_name_length
    }

    fn dispatch(&mut self, id: u64, line: &str) {
        let msg = match Message::parse(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("connection {id} parse error: {e}");
                return;
            }
        };
        debug!("connection {id} dispatching {}", msg.command);

        let state = match self.directory.user(id) {
            Some(u) => u.state.clone(),
            None => return,
        };
        let command = msg.command.to_ascii_uppercase();

        match state {
            RegState::Init if command != "NICK" => return,
            RegState::HaveNick if command != "USER" => return,
            RegState::HaveUser if command == "USER" => {
                self.send_to(
                    id,
                    &format_numeric(Numeric::ErrAlreadyRegistered, ":You may not reregister"),
                );
                return;
            }
            _ => {}
        }

        match command.as_str() {
            "NICK" => self.handle_nick(id, &msg),
            "USER" => self.handle_user(id, &msg),
            "PING" => {
                let params = msg.params.join(" ");
                self.send_to(id, &format!("PONG :{params}"));
            }
            "PONG" => {}
            "JOIN" => self.handle_join(id, &msg),
            "MODE" => self.handle_mode(id, &msg),
            "WHOIS" => self.handle_whois(id, &msg),
            "PRIVMSG" => self.handle_privmsg(id, &msg),
            "KICK" => self.handle_kick(id, &msg),
            "QUIT" => self.handle_quit(id, &msg),
            _ => {}
        }
    }

    fn handle_nick(&mut self, id: u64, msg: &Message) {
        let Some(nick) = msg.params.first() else {
            self.send_to(id, &format_numeric(Numeric::ErrNeedMoreParams, "NICK :Not enough parameters"));
            return;
        };
        if nick.len() > self.config.limits.max_nick_length {
            self.send_to(
                id,
                &format_numeric(Numeric::ErrErroneusNickname, &format!("{nick} :Erroneous nickname")),
            );
            return;
        }
        if self.directory.nick_in_use(nick) {
            self.send_to(
                id,
                &format_numeric(Numeric::ErrNicknameInUse, ":Nickname is already in use"),
            );
            return;
        }
        let was_init = matches!(
            self.directory.user(id).map(|u| u.state.clone()),
            Some(RegState::Init)
        );
        if let Some(user) = self.directory.user_mut(id) {
            user.nick = Some(nick.clone());
            if was_init {
                user.state = RegState::HaveNick;
            }
        }
        info!("connection {id} registered nick {nick}");
    }

    fn handle_user(&mut self, id: u64, msg: &Message) {
        if msg.params.len() < 4 {
            self.send_to(id, &format_numeric(Numeric::ErrNeedMoreParams, "USER :Not enough parameters"));
            return;
        }
        if let Some(user) = self.directory.user_mut(id) {
            user.username = Some(msg.params[0].clone());
            user.realname = Some(msg.params[3].clone());
            user.state = RegState::HaveUser;
        }
    }

    fn handle_join(&mut self, id: u64, msg: &Message) {
        let Some(target) = msg.params.first() else {
            self.send_to(id, &format_numeric(Numeric::ErrNeedMoreParams, "JOIN :Not enough parameters"));
            return;
        };
        if !self.valid_channel_name(target) {
            self.send_to(id, &format_numeric(Numeric::ErrNoSuchChannel, &format!("{target} :No such channel")));
            return;
        }
        if let Some(current) = self.directory.user(id).and_then(|u| u.channel.clone()) {
            self.announce_and_quit(id, &current, "left");
        }
        let already_existed = self.directory.channel(target).is_some();
        if let Err(e) = self.directory.join(id, target) {
            error!("join({id}, {target}) failed: {e}");
            return;
        }
        let nick = self
            .directory
            .user(id)
            .and_then(|u| u.nick.clone())
            .unwrap_or_else(|| format!("user{id}"));
        let suffix = if already_existed { "" } else { " as moderator" };
        self.broadcast(target, &format_system_privmsg(target, &format!("{nick} joined{suffix}")));
    }

    fn require_operator(&mut self, id: u64, channel: &str) -> bool {
        match self.directory.member(channel, id) {
            Some(m) if m.operator => true,
            Some(_) => {
                self.send_to(
                    id,
                    &format_numeric(Numeric::ErrChanOprivsNeeded, &format!("{channel} :You're not channel operator")),
                );
                false
            }
            None => {
                self.send_to(id, &format_numeric(Numeric::ErrNotOnChannel, &format!("{channel} :You're not on that channel")));
                false
            }
        }
    }

    fn handle_mode(&mut self, id: u64, msg: &Message) {
        if msg.params.len() < 3 {
            self.send_to(id, &format_numeric(Numeric::ErrNeedMoreParams, "MODE :Not enough parameters"));
            return;
        }
        let channel = match self.resolve_target_channel(id, &msg.params[0]) {
            Ok(c) => c,
            Err(numeric) => {
                self.send_to(id, &format_numeric(numeric, &format!("{} :You're not on a channel", msg.params[0])));
                return;
            }
        };
        if !self.require_operator(id, &channel) {
            return;
        }
        let modifier = &msg.params[1];
        let target_nick = &msg.params[2];
        let Some(target_id) = self.directory.user_by_nick(target_nick).map(|u| u.id) else {
            self.send_to(id, &format_numeric(Numeric::ErrNoSuchNick, &format!("{target_nick} :No such nick")));
            return;
        };
        if self.directory.member(&channel, target_id).is_none() {
            self.send_to(id, &format_numeric(Numeric::ErrNotOnChannel, &format!("{target_nick} {channel} :They aren't on that channel")));
            return;
        }
        match modifier.as_str() {
            "+v" => {
                self.directory.unmute(&channel, target_id);
            }
            "-v" => {
                self.directory.mute(&channel, target_id);
            }
            _ => {}
        }
    }

    fn handle_whois(&mut self, id: u64, msg: &Message) {
        let Some(target_nick) = msg.params.first() else {
            self.send_to(id, &format_numeric(Numeric::ErrNeedMoreParams, "WHOIS :Not enough parameters"));
            return;
        };
        let Some(channel) = self.directory.user(id).and_then(|u| u.channel.clone()) else {
            self.send_to(id, &format_numeric(Numeric::ErrNotOnChannel, ":You're not on a channel"));
            return;
        };
        if !self.require_operator(id, &channel) {
            return;
        }
        let Some(target) = self.directory.user_by_nick(target_nick) else {
            self.send_to(id, &format_numeric(Numeric::ErrNoSuchNick, &format!("{target_nick} :No such nick")));
            return;
        };
        let ipv4 = target.peer_ipv4;
        let username = target.username.clone().unwrap_or_default();
        let realname = target.realname.clone().unwrap_or_default();
        self.send_to(
            id,
            &format_numeric(
                Numeric::RplWhoisUser,
                &format!("{username} {ipv4} * :{realname}"),
            ),
        );
    }

    fn handle_privmsg(&mut self, id: u64, msg: &Message) {
        if msg.params.len() < 2 {
            self.send_to(id, &format_numeric(Numeric::ErrNeedMoreParams, "PRIVMSG :Not enough parameters"));
            return;
        }
        let channel = match self.resolve_target_channel(id, &msg.params[0]) {
            Ok(c) => c,
            Err(numeric) => {
                self.send_to(id, &format_numeric(numeric, &format!("{} :You're not on a channel", msg.params[0])));
                return;
            }
        };
        let member = self.directory.member(&channel, id).copied();
        match member {
            None => {
                self.send_to(id, &format_numeric(Numeric::ErrNotOnChannel, &format!("{channel} :You're not on that channel")));
            }
            Some(m) if m.muted => {
                self.send_to(id, &format_numeric(Numeric::ErrCannotSendToChan, ":Cannot send to channel"));
            }
            Some(_) => {
                let nick = self
                    .directory
                    .user(id)
                    .and_then(|u| u.nick.clone())
                    .unwrap_or_else(|| format!("user{id}"));
                let text = &msg.params[1];
                debug!("connection {id} PRIVMSG {channel} :{text}");
                self.broadcast(&channel, &format_user_privmsg(&nick, &channel, text));
            }
        }
    }

    fn handle_kick(&mut self, id: u64, msg: &Message) {
        if msg.params.len() < 2 {
            self.send_to(id, &format_numeric(Numeric::ErrNeedMoreParams, "KICK :Not enough parameters"));
            return;
        }
        let channel = match self.resolve_target_channel(id, &msg.params[0]) {
            Ok(c) => c,
            Err(numeric) => {
                self.send_to(id, &format_numeric(numeric, &format!("{} :You're not on a channel", msg.params[0])));
                return;
            }
        };
        if !self.require_operator(id, &channel) {
            return;
        }
        let victim_nick = &msg.params[1];
        let Some(victim_id) = self.directory.user_by_nick(victim_nick).map(|u| u.id) else {
            self.send_to(id, &format_numeric(Numeric::ErrNoSuchNick, &format!("{victim_nick} :No such nick")));
            return;
        };
        if self.directory.member(&channel, victim_id).is_none() {
            self.send_to(id, &format_numeric(Numeric::ErrNotOnChannel, &format!("{victim_nick} {channel} :They aren't on that channel")));
            return;
        }
        info!("connection {id} kicked {victim_id} from {channel}");
        self.announce_and_quit(victim_id, &channel, "was kicked");
    }

    fn handle_quit(&mut self, id: u64, msg: &Message) {
        let quit_message = msg.params.first().cloned();
        if let Some(channel) = self.directory.user(id).and_then(|u| u.channel.clone()) {
            let verb = quit_message.as_deref().unwrap_or("quit");
            self.announce_and_quit(id, &channel, verb);
        }
        info!("connection {id} quit");
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.connected = false;
        }
    }
}

#[cfg(test)]
mod tests {
    //! Scenarios 2 and 3 are exercised at the `Directory`/codec level, where
    //! the expected line is simple enough that reconstructing it doesn't
    //! hide a bug. Scenarios 4 and 5 involve a format string written by the
    //! handler itself, so those drive the real `Server` dispatch through a
    //! live (loopback) connection pair instead.
    use super::*;
    use crate::codec::{format_numeric, format_system_privmsg, Message, Numeric};
    use crate::directory::Directory;
    use std::net::{Ipv4Addr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    #[test]
    fn nick_collision_reply_matches_scenario_2() {
        let line = format_numeric(Numeric::ErrNicknameInUse, ":Nickname is already in use");
        assert_eq!(line, ":server 433 :Nickname is already in use");
    }

    #[test]
    fn operator_promotion_matches_scenario_3() {
        let mut dir = Directory::new();
        dir.register_connection(1, Ipv4Addr::LOCALHOST);
        dir.register_connection(2, Ipv4Addr::LOCALHOST);
        dir.join(1, "#room").unwrap();
        dir.join(2, "#room").unwrap();
        let promoted = dir.quit_channel(1, "#room").unwrap();
        assert_eq!(promoted, Some(2));
        let line = format_system_privmsg("#room", "bob promoted to operator");
        assert_eq!(line, ":system PRIVMSG #room :bob promoted to operator");
    }

    #[test]
    fn mute_suppresses_broadcast_eligibility() {
        let mut dir = Directory::new();
        dir.register_connection(1, Ipv4Addr::LOCALHOST);
        dir.register_connection(2, Ipv4Addr::LOCALHOST);
        dir.join(1, "#room").unwrap();
        dir.join(2, "#room").unwrap();
        dir.mute("#room", 2);
        assert!(dir.member("#room", 2).unwrap().muted);
    }

    fn test_server() -> Server {
        let mut config = Config::default();
        config.network.bind_address = "127.0.0.1".to_string();
        config.network.port = 0;
        Server::new(config).unwrap()
    }

    /// Wires a real, connected loopback socket into `server` under a
    /// freshly allocated id, registered with its poll exactly as the
    /// accept loop would. The peer end is returned and must be kept alive
    /// for the test's duration, or the kernel will tear down the pair.
    fn attach_connection(server: &mut Server) -> (u64, StdTcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let peer = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let token = server.poll.next_token();
        let id = token.0 as u64;
        let mut conn = Connection::new(
            id,
            token,
            ByteStream::new(mio::net::TcpStream::from_std(accepted)),
            server.config.limits.max_send_queue,
        );
        conn.register(&server.poll).unwrap();
        let peer_ipv4 = conn.peer_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        server.directory.register_connection(id, peer_ipv4);
        server.connections.insert(id, conn);
        (id, peer)
    }

    #[test]
    fn privmsg_while_muted_emits_404_without_channel_token() {
        let mut server = test_server();
        let (alice, _alice_peer) = attach_connection(&mut server);
        let (bob, _bob_peer) = attach_connection(&mut server);
        server.directory.user_mut(alice).unwrap().nick = Some("alice".to_string());
        server.directory.user_mut(bob).unwrap().nick = Some("bob".to_string());
        server.directory.join(alice, "#room").unwrap();
        server.directory.join(bob, "#room").unwrap();
        server.directory.mute("#room", bob);

        let msg = Message::parse("PRIVMSG --- :hello\n").unwrap();
        server.handle_privmsg(bob, &msg);

        let queued = server.connections.get(&bob).unwrap().queued_messages();
        assert_eq!(queued, vec![":server 404 :Cannot send to channel\n".to_string()]);
    }

    #[test]
    fn whois_reply_has_no_duplicate_nick_token() {
        let mut server = test_server();
        let (alice, _alice_peer) = attach_connection(&mut server);
        let (bob, _bob_peer) = attach_connection(&mut server);
        server.directory.user_mut(alice).unwrap().nick = Some("alice".to_string());
        {
            let bob_record = server.directory.user_mut(bob).unwrap();
            bob_record.nick = Some("bob".to_string());
            bob_record.username = Some("bob".to_string());
            bob_record.realname = Some("Bob B".to_string());
            bob_record.peer_ipv4 = Ipv4Addr::new(1, 2, 3, 4);
        }
        server.directory.join(alice, "#room").unwrap();
        server.directory.join(bob, "#room").unwrap();

        let msg = Message::parse("WHOIS bob\n").unwrap();
        server.handle_whois(alice, &msg);

        let queued = server.connections.get(&alice).unwrap().queued_messages();
        assert_eq!(queued, vec![":server 311 bob 1.2.3.4 * :Bob B\n".to_string()]);
    }
}
