//! 终端输入输出

use gattmsg_core::{DiscoveredPeer, DiscoveryFailure, SessionEvent};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// 逐行读取标准输入；空行被跳过，EOF 时通道关闭
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::error!("Failed to serialize output: {}", e),
    }
}

pub fn print_event(event: &SessionEvent, json: bool) {
    if json {
        print_json(event);
    } else if let Some(line) = describe(event) {
        println!("{line}");
    }
}

pub fn print_peers(peers: &[DiscoveredPeer]) {
    if peers.is_empty() {
        println!("   未发现设备");
        return;
    }
    for (i, peer) in peers.iter().enumerate() {
        println!("   [{}] {}", i, peer_line(peer));
    }
}

fn peer_line(peer: &DiscoveredPeer) -> String {
    let name = peer.name.as_deref().unwrap_or("<unknown>");
    match peer.rssi {
        Some(rssi) => format!("{} ({}, {} dBm)", name, peer.handle, rssi),
        None => format!("{} ({})", name, peer.handle),
    }
}

/// 人类可读的事件描述；过于频繁的事件返回 `None`
fn describe(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::RadioStateChanged { state } => format!("📶 蓝牙状态: {state:?}"),
        SessionEvent::PeerListChanged { .. } => return None,
        SessionEvent::ConnectionStateChanged { state, peer } => match peer {
            Some(peer) => format!("🔗 {state} ({peer})"),
            None => format!("🔗 {state}"),
        },
        SessionEvent::DiscoveryComplete { catalog } => format!(
            "✅ 发现完成: {} 个服务, {} 个特征",
            catalog.services().count(),
            catalog.characteristics().count()
        ),
        SessionEvent::DiscoveryFailed { reason } => match reason {
            DiscoveryFailure::NoServices => "❌ 对端没有任何服务".to_string(),
            DiscoveryFailure::Transport(e) => format!("❌ 发现失败: {e}"),
        },
        SessionEvent::MessageReceived { from, text } => match from {
            Some(from) => format!("💬 [{from}] {text}"),
            None => format!("💬 {text}"),
        },
        SessionEvent::WriteCompleted { result, .. } => match result {
            Ok(()) => "✉️  已发送".to_string(),
            Err(e) => format!("❌ 发送失败: {e}"),
        },
        SessionEvent::TransportError { message } => format!("⚠️  {message}"),
        SessionEvent::AdvertisingStateChanged { state } => format!("📡 广播状态: {state}"),
        SessionEvent::SubscribersChanged { count } => format!("👥 订阅者: {count}"),
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattmsg_core::PeerHandle;

    #[test]
    fn test_describe_message() {
        let event = SessionEvent::MessageReceived {
            from: Some(PeerHandle::from("AA:BB")),
            text: "hi".to_string(),
        };
        assert_eq!(describe(&event).as_deref(), Some("💬 [AA:BB] hi"));
    }

    #[test]
    fn test_peer_list_is_quiet() {
        let event = SessionEvent::PeerListChanged { peers: vec![] };
        assert_eq!(describe(&event), None);
    }

    #[test]
    fn test_peer_line() {
        let peer = DiscoveredPeer::new(PeerHandle::from("AA:BB")).with_rssi(-70);
        assert_eq!(peer_line(&peer), "<unknown> (AA:BB, -70 dBm)");
    }
}
