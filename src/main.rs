use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use huddle::api::HttpChatApi;
use huddle::config::{Cli, Config};
use huddle::engine::{ChatEngine, Command, Notice};
use huddle::logging;
use huddle::types::{ConnectionStatus, ConversationRef, DeliveryState};
use huddle::ws::WsWire;

#[tokio::main]
async fn main() {
    logging::init();
    let config = match Config::from_cli(Cli::parse()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(2);
        }
    };

    let api = HttpChatApi::new(&config.api_url, &config.token);
    let wire = WsWire::new(&config.ws_url);
    let (engine, handle) = ChatEngine::new(
        &config.user,
        &config.token,
        wire,
        api,
        config.chat_with.clone(),
    );

    let mut notices = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            print_notice(&notice);
        }
    });

    let engine_task = tokio::spawn(engine.run());
    handle.send(Command::Connect);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(command) = parse_line(line) {
            handle.send(command);
        } else {
            println!("unrecognized command: {line}");
        }
    }

    handle.send(Command::Disconnect);
    drop(handle);
    let _ = engine_task.await;
}

fn parse_line(line: &str) -> Option<Command> {
    if !line.starts_with('/') {
        return Some(Command::SendText(line.to_string()));
    }
    let mut parts = line.splitn(3, ' ');
    let verb = parts.next()?;
    let first = parts.next();
    let rest = parts.next();
    match (verb, first, rest) {
        ("/select", Some(user), None) => {
            Some(Command::Select(ConversationRef::private(user)))
        }
        ("/group", Some(id), name) => Some(Command::Select(ConversationRef::group(
            id,
            name.unwrap_or(id),
        ))),
        ("/clear", None, None) => Some(Command::ClearSelection),
        ("/roster", None, None) => Some(Command::RefreshRoster),
        ("/join", Some(id), None) => Some(Command::JoinGroup(id.to_string())),
        ("/leave", Some(id), None) => Some(Command::LeaveGroup(id.to_string())),
        ("/create", Some(name), description) => Some(Command::CreateGroup {
            name: name.to_string(),
            description: description.map(str::to_string),
        }),
        ("/delete", Some(id), None) => Some(Command::DeleteGroup(id.to_string())),
        ("/add", Some(id), Some(user)) => Some(Command::AddMember {
            group_id: id.to_string(),
            user: user.to_string(),
        }),
        ("/kick", Some(id), Some(user)) => Some(Command::RemoveMember {
            group_id: id.to_string(),
            user: user.to_string(),
        }),
        _ => None,
    }
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::Connection(status) => {
            let label = match status {
                ConnectionStatus::Disconnected => "disconnected",
                ConnectionStatus::Connecting => "connecting...",
                ConnectionStatus::Connected => "connected",
            };
            println!("* {label}");
        }
        Notice::ConnectionFailed { reason } => println!("* connection failed: {reason}"),
        Notice::SelectionChanged { active: Some(chat) } => {
            println!("* now in {chat} ({})", chat.display_name)
        }
        Notice::SelectionChanged { active: None } => println!("* no conversation selected"),
        Notice::SelectionFailed { target, reason } => {
            println!("* could not open {target}: {reason}")
        }
        Notice::TimelineReplaced { messages } => {
            for message in messages {
                print_message(message);
            }
        }
        Notice::MessageAppended(message) => print_message(message),
        Notice::MessageConfirmed { .. } => {}
        Notice::MembershipUpdated(snapshot) => {
            let mut members: Vec<&str> = snapshot.members.iter().map(String::as_str).collect();
            members.sort_unstable();
            println!("* members: {}", members.join(", "));
        }
        Notice::RosterUpdated { friends, groups } => {
            println!("* conversations: {}", friends.join(", "));
            for group in groups {
                println!("* group {}: {}", group.group_id, group.group_name);
            }
        }
        Notice::RosterFailed { reason } => println!("* roster fetch failed: {reason}"),
        Notice::SendFailed { reason, .. } => println!("* send failed: {reason}"),
        Notice::GroupActionFailed { action, reason } => {
            println!("* {action} failed: {reason}")
        }
    }
}

fn print_message(message: &huddle::types::Message) {
    let marker = match message.delivery {
        DeliveryState::Pending => " (sending)",
        DeliveryState::Confirmed => "",
    };
    println!("<{}> {}{marker}", message.sender, message.text);
}
