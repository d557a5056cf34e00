//! Configuration types.
//!
//! Everything is read from environment variables (plus two optional JSON
//! files for reply rules and account bindings). Values that are set but
//! cannot be parsed are rejected instead of silently defaulted.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Default system prompt for reply composition.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the customer service assistant for a phone-secured \
lending shop. Answer the customer's latest message briefly and politely, in the customer's \
language. Explain loan amounts, interest and the application process when asked. Never \
invent prices or approval decisions; invite the customer to visit or send details instead. \
Do not include links.";

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// Global auto-reply switch; per-account flags apply on top of it.
    pub auto_reply_enabled: bool,
    pub webhook_port: u16,
    pub verify_token: Option<String>,
    pub accounts_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub llm: LlmConfig,
    pub reply: ReplyConfig,
    pub sweep: SweepConfig,
    pub telegram: Option<TelegramConfig>,
}

impl AppConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("AUTO_REPLY_LLM_API_KEY")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTO_REPLY_LLM_API_KEY".into()))?;

        let backend = match lookup("AUTO_REPLY_LLM_BACKEND").as_deref() {
            None | Some("anthropic") => LlmBackend::Anthropic,
            Some("openai") => LlmBackend::OpenAi,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "AUTO_REPLY_LLM_BACKEND".into(),
                    message: format!("unknown backend '{other}'"),
                });
            }
        };

        let model = lookup("AUTO_REPLY_MODEL").unwrap_or_else(|| match backend {
            LlmBackend::Anthropic => "claude-3-5-haiku-latest".to_string(),
            LlmBackend::OpenAi => "gpt-4o-mini".to_string(),
        });

        let rules = match lookup("AUTO_REPLY_RULES_FILE") {
            Some(path) => ReplyRules::load(Path::new(&path))?,
            None => ReplyRules::default(),
        };

        let reply = ReplyConfig {
            max_history_turns: parse_or(&lookup, "AUTO_REPLY_MAX_HISTORY_TURNS", 10)?,
            max_tokens: parse_or(&lookup, "AUTO_REPLY_MAX_TOKENS", 300)?,
            max_chars: parse_or(&lookup, "AUTO_REPLY_MAX_CHARS", 2000)?,
            comment_max_chars: parse_or(&lookup, "AUTO_REPLY_COMMENT_MAX_CHARS", 8000)?,
            promo_link: lookup("AUTO_REPLY_PROMO_LINK").filter(|s| !s.trim().is_empty()),
            system_prompt: lookup("AUTO_REPLY_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            rules,
        };

        let sweep = SweepConfig {
            interval: Duration::from_secs(parse_or(&lookup, "AUTO_REPLY_SWEEP_INTERVAL_SECS", 300)?),
            unanswered_age: Duration::from_secs(parse_or(
                &lookup,
                "AUTO_REPLY_UNANSWERED_AGE_SECS",
                300,
            )?),
            fetch_delay: Duration::from_millis(parse_or(
                &lookup,
                "AUTO_REPLY_SWEEP_FETCH_DELAY_MS",
                300,
            )?),
            batch_size: parse_or(&lookup, "AUTO_REPLY_SWEEP_BATCH_SIZE", 10)?,
            batch_delay: Duration::from_millis(parse_or(
                &lookup,
                "AUTO_REPLY_SWEEP_BATCH_DELAY_MS",
                3000,
            )?),
            conversation_limit: parse_or(&lookup, "AUTO_REPLY_SWEEP_CONVERSATION_LIMIT", 25)?,
        };
        if sweep.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "AUTO_REPLY_SWEEP_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let telegram = match (
            lookup("TELEGRAM_BOT_TOKEN"),
            lookup("TELEGRAM_OPERATOR_CHAT_ID"),
        ) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramConfig {
                bot_token: SecretString::from(bot_token),
                chat_id,
            }),
            _ => None,
        };

        Ok(Self {
            db_path: lookup("AUTO_REPLY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/auto-reply.db")),
            auto_reply_enabled: parse_or(&lookup, "AUTO_REPLY_ENABLED", true)?,
            webhook_port: parse_or(&lookup, "AUTO_REPLY_WEBHOOK_PORT", 8080)?,
            verify_token: lookup("AUTO_REPLY_VERIFY_TOKEN"),
            accounts_file: lookup("AUTO_REPLY_ACCOUNTS_FILE").map(PathBuf::from),
            log_dir: lookup("AUTO_REPLY_LOG_DIR").map(PathBuf::from),
            llm: LlmConfig {
                backend,
                api_key: SecretString::from(api_key),
                model,
            },
            reply,
            sweep,
            telegram,
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Reply composition settings.
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    /// Prior turns (inbound + reply pairs) used as grounding.
    pub max_history_turns: usize,
    /// Output token budget for the completion backend.
    pub max_tokens: u32,
    /// Hard length limit for direct replies, in characters.
    pub max_chars: usize,
    /// Hard length limit for comment replies, in characters.
    pub comment_max_chars: usize,
    /// Promotional call-to-action, sent at most once per customer.
    pub promo_link: Option<String>,
    pub system_prompt: String,
    pub rules: ReplyRules,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            max_history_turns: 10,
            max_tokens: 300,
            max_chars: 2000,
            comment_max_chars: 8000,
            promo_link: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            rules: ReplyRules::default(),
        }
    }
}

/// Keyword lists and canned replies, optionally loaded from JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplyRules {
    /// Buy/sell vocabulary. Always spam, even alongside business terms.
    pub trade_keywords: Vec<String>,
    /// Business vocabulary (question markers, price and process terms).
    pub business_keywords: Vec<String>,
    /// Canned replies for early exchanges, checked in order.
    pub canned_replies: Vec<CannedReply>,
    /// How many of a customer's first successful replies may be canned.
    pub canned_reply_limit: usize,
}

/// A canonical category with its configured reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CannedReply {
    pub category: String,
    pub keywords: Vec<String>,
    pub reply: String,
}

impl ReplyRules {
    /// Load rules from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            ConfigError::ParseError(format!("{}: {e}", path.display()))
        })
    }
}

impl Default for ReplyRules {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            trade_keywords: words(&[
                "买", "卖", "收购", "出售", "回收", "求购", "buy", "sell", "selling", "for sale",
                "wts", "wtb",
            ]),
            business_keywords: words(&[
                "?", "？", "借", "贷", "额度", "利息", "利率", "多少", "价格", "怎么", "流程",
                "手续", "要求", "可以吗", "borrow", "loan", "interest", "rate", "price",
                "how much", "how", "process", "apply",
            ]),
            canned_replies: vec![
                CannedReply {
                    category: "greeting".into(),
                    keywords: words(&["你好", "您好", "在吗", "hello", "hi"]),
                    reply: "您好！很高兴为您服务，请问有什么可以帮您？".into(),
                },
                CannedReply {
                    category: "interest".into(),
                    keywords: words(&["利息", "利率", "interest", "rate"]),
                    reply: "利息按机型和借款期限计算，请告诉我们您的手机型号和想借的金额，我们马上为您估算。".into(),
                },
                CannedReply {
                    category: "process".into(),
                    keywords: words(&["流程", "手续", "需要什么", "process", "requirements"]),
                    reply: "流程很简单：带上手机和身份证到店评估，当场放款。也可以先发手机型号给我们预估额度。".into(),
                },
                CannedReply {
                    category: "location".into(),
                    keywords: words(&["地址", "在哪", "门店", "where", "location", "address"]),
                    reply: "我们的门店地址和营业时间请查看主页信息，欢迎随时到店咨询。".into(),
                },
            ],
            canned_reply_limit: 3,
        }
    }
}

/// Reconciliation sweep settings.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between the end of one sweep and the start of the next.
    pub interval: Duration,
    /// A message must be at least this old to become a candidate.
    pub unanswered_age: Duration,
    /// Delay after every conversation fetch.
    pub fetch_delay: Duration,
    /// Every `batch_size` fetches, pause for `batch_delay`.
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Conversations listed per account per sweep.
    pub conversation_limit: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            unanswered_age: Duration::from_secs(300),
            fetch_delay: Duration::from_millis(300),
            batch_size: 10,
            batch_delay: Duration::from_secs(3),
            conversation_limit: 25,
        }
    }
}

impl SweepConfig {
    /// Configuration without pacing delays (tests, manual sweeps).
    pub fn unpaced(unanswered_age: Duration) -> Self {
        Self {
            unanswered_age,
            fetch_delay: Duration::ZERO,
            batch_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Operator notification channel (Telegram Bot API).
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
}
