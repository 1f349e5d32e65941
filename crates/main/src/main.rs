//! 同步客户端入口
//!
//! 加载配置，建立一个已认证会话，打开 `SYNC_CONVERSATIONS` 中列出的会话
//! （以及可选的管理后台），持续记录状态变化，直到 Ctrl-C。

use std::{env, sync::Arc};

use anyhow::Context;
use application::{Collaborators, Credentials, SyncClient, SyncSettings};
use config::SyncConfig;
use domain::{ConversationId, UserId};
use infrastructure::{RestClient, WebSocketTransport};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = SyncConfig::load().context("加载配置失败")?;
    info!(config = %config.sanitize(), "配置已加载");

    let token = env::var("SYNC_TOKEN").unwrap_or_default();
    let user_id = UserId::parse(env::var("SYNC_USER_ID").unwrap_or_else(|_| "me".to_string()))
        .context("SYNC_USER_ID 无效")?;

    let rest = Arc::new(
        RestClient::from_config(&config)
            .context("创建 REST 客户端失败")?
            .with_token(token.clone()),
    );
    let client = SyncClient::new(
        user_id,
        Collaborators {
            transport: Arc::new(WebSocketTransport::from_config(&config)),
            metrics: rest.clone(),
            conversations: rest,
        },
        SyncSettings::from(&config),
    );

    let mut states = client.watch_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(state = %state, "会话状态变化");
        }
    });

    let mut errors = client.subscribe_errors();
    tokio::spawn(async move {
        while let Ok(err) = errors.recv().await {
            error!(kind = ?err.kind, attempts = err.attempts, error = %err.message, "推送连接不可用");
        }
    });

    let mut snapshots = client.watch_snapshot();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let groups: Vec<String> = snapshots
                .borrow_and_update()
                .groups()
                .map(|(name, _)| name.to_owned())
                .collect();
            info!(groups = ?groups, "指标快照已更新");
        }
    });

    client
        .connect(Credentials::bearer(token))
        .context("建立推送连接失败")?;

    let conversations = env::var("SYNC_CONVERSATIONS").unwrap_or_default();
    for id in conversations.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        let conversation_id = ConversationId::parse(id).context("会话 id 无效")?;
        match client.open_conversation(&conversation_id).await {
            Ok(messages) => info!(conversation = %conversation_id, count = messages.len(), "会话已打开"),
            Err(err) => warn!(conversation = %conversation_id, error = %err, "打开会话失败"),
        }
    }

    if env::var("SYNC_ADMIN").is_ok_and(|value| value == "1" || value == "true") {
        if let Err(err) = client.join_admin_dashboard().await {
            warn!(error = %err, "加载仪表盘快照失败");
        }
    }

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    info!("收到退出信号，拆除会话");
    client.shutdown();
    Ok(())
}
