//! Message templates — `{name}`, `{amount}`, `{due_date}`, `{protocol}`.

use dunning_core::config::DeliveryConfig;

use crate::recipient::Recipient;

/// Renders the message body for a recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    body: String,
    currency_symbol: String,
}

impl MessageTemplate {
    pub fn new(body: &str, currency_symbol: &str) -> Self {
        Self {
            body: body.to_string(),
            currency_symbol: currency_symbol.to_string(),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(&config.template, &config.currency_symbol)
    }

    /// Substitute placeholders in one left-to-right pass; substituted values
    /// are never rescanned. Unknown `{...}` sequences are kept as written.
    pub fn render(&self, recipient: &Recipient) -> String {
        let mut out = String::with_capacity(self.body.len() + 32);
        let mut rest = self.body.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let Some(close) = tail.find('}') else {
                rest = tail;
                break;
            };
            match self.value(&tail[1..close], recipient) {
                Some(value) => {
                    out.push_str(&value);
                    rest = &tail[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn value(&self, placeholder: &str, recipient: &Recipient) -> Option<String> {
        match placeholder {
            "name" => Some(recipient.name.trim().to_string()),
            "amount" => Some(format_amount(recipient.amount_cents, &self.currency_symbol)),
            "due_date" => Some(recipient.due_date.format("%d/%m/%Y").to_string()),
            "protocol" => Some(
                recipient
                    .document
                    .as_ref()
                    .and_then(|d| d.protocol.clone())
                    .unwrap_or_default(),
            ),
            _ => None,
        }
    }
}

/// `150000` cents → `R$ 1.500,00`.
pub fn format_amount(cents: u64, symbol: &str) -> String {
    let units = (cents / 100).to_string();
    let mut grouped = String::with_capacity(units.len() + units.len() / 3);
    for (i, ch) in units.chars().enumerate() {
        if i > 0 && (units.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    format!("{} {},{:02}", symbol, grouped, cents % 100)
}
