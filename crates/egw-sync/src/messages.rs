//! HTML message texts sent to chats and subscribers.

use chrono::{DateTime, Utc};
use egw_core::{Game, SubscriberNotice};

use crate::reconcile::{RescheduleNotice, ScheduleChange};
use crate::store::{BroadcastKind, RoleCounts};

const DATE_FORMAT: &str = "%d.%m.%Y %H:%M:%S";
const NOT_SPECIFIED: &str = "не указано";
/// Telegram rejects longer messages.
pub const MAX_MESSAGE_LEN: usize = 4096;

pub const ANNOUNCEMENT_HEADER: &str = "📢 <b>Анонс игры</b>";
pub const START_NOTICE_HEADER: &str = "🚀 <b>Скоро старт</b>";
pub const RESCHEDULE_HEADER: &str = "🔄 <b>Изменение дат игры</b>";

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Mirror domains are shown under their short name.
pub fn user_facing_link(link: &str) -> String {
    link.replace(".encounter.cx", ".en.cx")
}

/// Timestamps are rendered in the source's local time.
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    offset: chrono::FixedOffset,
}

fn capacity_text(game: &Game) -> String {
    if game.is_single() {
        return "один игрок".to_string();
    }
    match game.capacity {
        Some(n) if n > 0 => n.to_string(),
        _ => NOT_SPECIFIED.to_string(),
    }
}

fn price_text(price: &str) -> String {
    match price.split_whitespace().next() {
        Some(first) if first != "0" => escape_html(first),
        _ => NOT_SPECIFIED.to_string(),
    }
}

impl Formatter {
    pub fn new(offset: chrono::FixedOffset) -> Self {
        Self { offset }
    }

    fn date(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset).format(DATE_FORMAT).to_string()
    }

    fn optional_date(&self, at: Option<DateTime<Utc>>) -> String {
        at.map(|at| self.date(at))
            .unwrap_or_else(|| "не указана".to_string())
    }

    fn title(&self, game: &Game) -> String {
        format!(
            "<b>🎮 <a href=\"{}\">{}</a></b>",
            escape_html(&user_facing_link(&game.link)),
            escape_html(&game.name)
        )
    }

    /// Full card used for announcements and start notices.
    pub fn broadcast(&self, kind: BroadcastKind, game: &Game) -> String {
        let header = match kind {
            BroadcastKind::Announcement => ANNOUNCEMENT_HEADER,
            BroadcastKind::StartNotice => START_NOTICE_HEADER,
        };
        format!(
            "{header}\n{title}\n\
             <b>📅 Начало:</b> {start}\n\
             <b>📆 Конец:</b> {end}\n\
             <b>📝 Автор(ы):</b> {author}\n\
             <b>🌐 Домен:</b> {domain}\n\
             <b>💰 Взнос:</b> {price}\n\
             <b>🎭 Тип игры:</b> {kind}\n\
             <b>👥 Ограничение игроков:</b> {players}",
            title = self.title(game),
            start = self.date(game.start_time),
            end = self.optional_date(game.end_time),
            author = escape_html(&game.author),
            domain = escape_html(&game.domain),
            price = price_text(&game.price),
            kind = if game.is_single() { "одиночная" } else { "командная" },
            players = capacity_text(game),
        )
    }

    pub fn reschedule(&self, game: &Game, notice: &RescheduleNotice) -> String {
        let mut text = format!(
            "{RESCHEDULE_HEADER}\n{title}\n<b>📝 Автор(ы):</b> {author}\n<b>🌐 Домен:</b> {domain}\n",
            title = self.title(game),
            author = escape_html(&game.author),
            domain = escape_html(&game.domain),
        );
        let old_start = self.date(notice.old_start);
        let new_start = self.date(notice.new_start);
        let old_end = self.optional_date(notice.old_end);
        let new_end = self.optional_date(notice.new_end);
        let body = match notice.change {
            ScheduleChange::StartOnly => format!(
                "<i>⚠️ Дата начала игры изменена.</i>\n\
                 ├ <b>Прежнее начало:</b> {old_start}\n\
                 └ 🟢 <b>Новое начало:</b> {new_start}"
            ),
            ScheduleChange::EndOnly => format!(
                "<i>⚠️ Дата окончания игры изменена.</i>\n\
                 ├ <b>Прежний конец:</b> {old_end}\n\
                 └ 🟢 <b>Новый конец:</b> {new_end}"
            ),
            ScheduleChange::Both => format!(
                "<i>⚠️ Изменены даты начала и окончания игры.</i>\n\
                 ├ <b>Прежнее начало:</b> {old_start}\n\
                 ├ <b>Прежний конец:</b> {old_end}\n\
                 ├ 🟢 <b>Новое начало:</b> {new_start}\n\
                 └ 🟢 <b>Новый конец:</b> {new_end}"
            ),
        };
        text.push_str(&body);
        text
    }

    pub fn subscriber_notice(&self, notice: SubscriberNotice, game: &Game) -> String {
        let line = match notice {
            SubscriberNotice::Started => "🏁 Игра началась! Удачи!".to_string(),
            SubscriberNotice::Equator => format!(
                "⏳ Экватор игры: прошла половина времени. Финиш {}.",
                self.optional_date(game.end_time)
            ),
            SubscriberNotice::NearEnd => format!(
                "⌛ До окончания игры осталось немного. Финиш {}.",
                self.optional_date(game.end_time)
            ),
        };
        format!("{}\n{line}", self.title(game))
    }

    /// One compact line block per game, for listings.
    pub fn game_line(&self, game: &Game) -> String {
        let players = match game.capacity {
            Some(n) if n > 0 => n.to_string(),
            _ => NOT_SPECIFIED.to_string(),
        };
        format!(
            "🎮 <b>{name}</b> (id {id})\n📅 Дата начала: {start}\n👥 Количество участников: {players}\n🔗 {link}\n",
            name = escape_html(&game.name),
            id = game.id,
            start = self.date(game.start_time),
            link = escape_html(&user_facing_link(&game.link)),
        )
    }

    /// Splits game blocks into messages no longer than `max_len` bytes; a
    /// block is never split.
    pub fn game_listing(&self, games: &[Game], max_len: usize) -> Vec<String> {
        let mut parts = Vec::new();
        let mut current = String::new();
        for game in games {
            let block = self.game_line(game);
            if !current.is_empty() && current.len() + block.len() + 1 > max_len {
                parts.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&block);
        }
        if !current.is_empty() {
            parts.push(current);
        }
        parts
    }
}

pub fn role_summary(counts: RoleCounts, opposite_nicknames: &[String]) -> String {
    let mut text = format!(
        "Ищут команду: {}\nИщут игроков: {}",
        counts.seeking_game, counts.seeking_team
    );
    if opposite_nicknames.is_empty() {
        text.push_str("\nПока никто не откликнулся.");
    } else {
        text.push_str("\nМогут подойти: ");
        text.push_str(
            &opposite_nicknames
                .iter()
                .map(|n| escape_html(n))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }
    text
}
