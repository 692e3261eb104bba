//! 出站通知拦截
//!
//! 宿主集成层暴露一个窗口级的出站通知端口（[`NotificationSink`]）。
//! [`InterceptedChannel`] 包装该端口：先交给观察者检查，再把同一个通知原样转发。
//! 观察者的任何失败（包括 panic）都在这里吞掉，绝不影响转发。

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// 一条出站通知：通道名加参数列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// 其余顶层字段，原样保留
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// 收到时的原始文本，转发时优先使用
    #[serde(skip)]
    pub raw: Option<String>,
}

impl Notification {
    pub fn new(channel: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            channel: channel.into(),
            args,
            extra: Map::new(),
            raw: None,
        }
    }

    /// 解析一行 JSON，并记住原始文本
    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        let mut notification: Self = serde_json::from_str(line)?;
        notification.raw = Some(line.to_string());
        Ok(notification)
    }

    /// 转发用的单行文本：有原始文本时逐字节返回原文，否则重新序列化
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        match &self.raw {
            Some(raw) => Ok(raw.clone()),
            None => serde_json::to_string(self),
        }
    }
}

/// 宿主的正常投递路径
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: Notification);
}

/// 只读观察出站通知
pub trait NotificationObserver: Send + Sync {
    fn observe(&self, notification: &Notification) -> Result<()>;
}

/// 在宿主投递路径前插入观察者的通道
pub struct InterceptedChannel<S> {
    window: String,
    observer: Arc<dyn NotificationObserver>,
    downstream: S,
}

impl<S: NotificationSink> InterceptedChannel<S> {
    pub fn new(
        window: impl Into<String>,
        observer: Arc<dyn NotificationObserver>,
        downstream: S,
    ) -> Self {
        Self {
            window: window.into(),
            observer,
            downstream,
        }
    }

    pub fn window(&self) -> &str {
        &self.window
    }

    /// 被包装的宿主投递路径
    pub fn downstream(&self) -> &S {
        &self.downstream
    }
}

impl<S: NotificationSink> NotificationSink for InterceptedChannel<S> {
    fn send(&self, notification: Notification) {
        let observed = panic::catch_unwind(AssertUnwindSafe(|| {
            self.observer.observe(&notification)
        }));
        match observed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                "[Capture] 处理通知失败 (window={}, channel={}): {:#}",
                self.window, notification.channel, e
            ),
            Err(_) => error!(
                "[Capture] 处理通知时发生 panic (window={}, channel={})",
                self.window, notification.channel
            ),
        }
        self.downstream.send(notification);
    }
}

/// 增量通知命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaCommand {
    /// 收到新消息
    RecvMsg,
    /// 收到活跃会话新消息
    RecvActiveMsg,
    /// 本端发出消息
    AddSendMsg,
    /// 消息列表更新
    MsgInfoListUpdate,
}

impl DeltaCommand {
    /// 按命令名子串识别
    pub fn from_cmd_name(cmd_name: &str) -> Option<Self> {
        if cmd_name.contains("onRecvActiveMsg") {
            Some(DeltaCommand::RecvActiveMsg)
        } else if cmd_name.contains("onRecvMsg") {
            Some(DeltaCommand::RecvMsg)
        } else if cmd_name.contains("onAddSendMsg") {
            Some(DeltaCommand::AddSendMsg)
        } else if cmd_name.contains("onMsgInfoListUpdate") {
            Some(DeltaCommand::MsgInfoListUpdate)
        } else {
            None
        }
    }
}

/// 从一条通知中识别出的事件
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent<'a> {
    /// 会话当前可见消息的全量列表
    Snapshot { messages: &'a [Value] },
    /// 增量消息
    Delta {
        command: DeltaCommand,
        messages: Vec<&'a Value>,
    },
    /// 本端用户资料变更，携带本端 uid
    ProfileChanged { uid: &'a str },
}

/// 识别一条通知；与捕获无关的通知返回空列表
///
/// 全量与增量检查相互独立，同一通知可能同时命中。
pub fn classify(notification: &Notification) -> Vec<NotificationEvent<'_>> {
    let mut events = Vec::new();
    let args = &notification.args;
    if args.len() < 2 {
        return events;
    }

    let snapshot = args.iter().find_map(|arg| {
        arg.get("msgList")
            .and_then(Value::as_array)
            .filter(|list| !list.is_empty())
    });
    if let Some(list) = snapshot {
        events.push(NotificationEvent::Snapshot { messages: list });
    }

    let command = args.iter().find_map(|arg| {
        arg.as_array()
            .and_then(|items| items.first())
            .filter(|first| first.get("cmdName").is_some_and(|c| !c.is_null()))
    });
    if let Some(command) = command {
        classify_command(command, &mut events);
    }

    events
}

fn classify_command<'a>(command: &'a Value, events: &mut Vec<NotificationEvent<'a>>) {
    let Some(cmd_name) = command.get("cmdName").and_then(Value::as_str) else {
        return;
    };
    let payload = command.get("payload").filter(|p| !p.is_null());

    if cmd_name.contains("onProfileDetailInfoChanged") {
        let uid = payload
            .and_then(|p| p.get("info"))
            .and_then(|info| info.get("uid"))
            .and_then(Value::as_str);
        if let Some(uid) = uid {
            events.push(NotificationEvent::ProfileChanged { uid });
        }
    }

    let (Some(delta), Some(payload)) = (DeltaCommand::from_cmd_name(cmd_name), payload) else {
        return;
    };
    let msg_list = payload.get("msgList").and_then(Value::as_array);
    let messages: Option<Vec<&Value>> = match delta {
        DeltaCommand::RecvMsg | DeltaCommand::RecvActiveMsg | DeltaCommand::MsgInfoListUpdate => {
            msg_list.map(|list| list.iter().collect())
        }
        DeltaCommand::AddSendMsg => match msg_list {
            Some(list) => Some(list.iter().collect()),
            None => payload
                .get("msgRecord")
                .filter(|r| !r.is_null())
                .map(|record| vec![record]),
        },
    };
    if let Some(messages) = messages {
        events.push(NotificationEvent::Delta {
            command: delta,
            messages,
        });
    }
}
