use std::fmt::Write as _;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use indexmap::IndexSet;
use time::UtcOffset;

use crate::app::{
    parse_deliver_at, ActionDispatcher, App, BulkOutcome, ComposeView, Delivery, InboxEntry,
    InboxView, SentEntry, SentView,
};
use crate::clock::{self, display_time, Clock};
use crate::config::{AppConfig, ConfigPaths};
use crate::export;
use crate::letters::{LetterFilter, LetterId};
use crate::session::{SessionContext, SessionManager};
use crate::store::{LetterStore, SqliteStore};

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// Group code shared by every member
    pub group: String,
    /// Name the other members will see
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Recipient name
    pub to: String,
    /// Letter body. If omitted, reads from stdin.
    pub message: Option<String>,
    /// Deliver later, e.g. "2024-05-01 18:30" (display offset) or RFC 3339
    #[arg(long)]
    pub at: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Limit the number of letters printed
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ReadArgs {
    /// Letter ids or unique id prefixes
    #[arg(required = true)]
    pub ids: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Letter ids or unique id prefixes
    #[arg(required = true)]
    pub ids: Vec<String>,
    /// Delete from your sent list instead of your inbox
    #[arg(long)]
    pub sent: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StarArgs {
    /// Letter id or unique id prefix
    pub id: String,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Letter id or unique id prefix
    pub id: String,
    /// Replacement body
    #[arg(long)]
    pub message: Option<String>,
    /// New delivery time
    #[arg(long)]
    pub at: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Inbox letters to export
    pub ids: Vec<String>,
    /// Export the whole inbox
    #[arg(long, conflicts_with = "ids")]
    pub all: bool,
    /// Output file (defaults to the configured export path)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Everything a one-shot command needs: the store, a clock and the saved session.
pub struct CommandContext {
    config: Arc<AppConfig>,
    store: SqliteStore,
    clock: Arc<dyn Clock>,
    sessions: SessionManager,
}

impl CommandContext {
    pub fn new(config: Arc<AppConfig>, store: SqliteStore, paths: &ConfigPaths) -> Self {
        let clock = clock::from_options(&config.clock, Arc::new(store.clone()));
        Self {
            sessions: SessionManager::load(&paths.session_file),
            config,
            store,
            clock,
        }
    }

    fn offset(&self) -> UtcOffset {
        self.config.utc_offset()
    }

    fn session(&self) -> Result<&SessionContext> {
        self.sessions
            .current()
            .context("not joined to a group; run `letters join <GROUP> <NAME>` first")
    }

    fn actions(&self) -> Result<ActionDispatcher<'_>> {
        Ok(ActionDispatcher::new(
            &self.store,
            self.clock.as_ref(),
            self.session()?,
        ))
    }

    fn inbox_view(&self) -> Result<InboxView> {
        let session = self.session()?;
        let letters = self
            .store
            .fetch(&LetterFilter::addressed_to(&session.group_id, &session.user))
            .context("loading inbox")?;
        let mut view = InboxView::new(session);
        view.apply_snapshot(letters, self.clock.now());
        Ok(view)
    }

    fn sent_view(&self) -> Result<SentView> {
        let session = self.session()?;
        let letters = self
            .store
            .fetch(&LetterFilter::authored_by(&session.group_id, &session.user))
            .context("loading sent letters")?;
        let mut view = SentView::new(session);
        view.apply_snapshot(letters, self.clock.now());
        Ok(view)
    }
}

pub fn run_tui(app: &mut App) -> Result<()> {
    app.run()
}

pub fn join(ctx: &mut CommandContext, args: JoinArgs) -> Result<String> {
    let session = ctx.sessions.join(&args.group, &args.name)?;
    Ok(format!(
        "Joined group {} as {}\n",
        session.group_id, session.user
    ))
}

pub fn leave(ctx: &mut CommandContext) -> Result<String> {
    Ok(match ctx.sessions.leave()? {
        Some(session) => format!("Left group {}\n", session.group_id),
        None => "Not in a group.\n".to_string(),
    })
}

pub fn whoami(ctx: &CommandContext) -> Result<String> {
    Ok(match ctx.sessions.current() {
        Some(session) => format!("{} in group {}\n", session.user, session.group_id),
        None => "Not in a group. Run `letters join <GROUP> <NAME>`.\n".to_string(),
    })
}

pub fn send(ctx: &CommandContext, args: SendArgs) -> Result<String> {
    let actions = ctx.actions()?;
    let message = match args.message {
        Some(message) => message,
        None => read_stdin()?.context("no message given; pass it as an argument or on stdin")?,
    };
    let deliver_at = args
        .at
        .as_deref()
        .map(|at| parse_deliver_at(at, ctx.offset()))
        .transpose()?;
    let id = actions
        .send(&args.to, &message, deliver_at)
        .with_context(|| format!("sending letter to {}", args.to.trim()))?;
    let delivery = Delivery {
        id,
        scheduled: deliver_at.is_some(),
    };
    let mut out = format!("{} {}", delivery.notice(), delivery.id.short());
    if let Some(at) = deliver_at {
        let _ = write!(&mut out, " (delivers {})", display_time(at, ctx.offset()));
    }
    out.push('\n');
    Ok(out)
}

pub fn inbox(ctx: &CommandContext, args: ListArgs) -> Result<String> {
    let view = ctx.inbox_view()?;
    let shown = args.limit.min(view.entries().len());
    Ok(format_inbox(
        &view.entries()[..shown],
        view.unread_count(),
        ctx.offset(),
    ))
}

pub fn sent(ctx: &CommandContext, args: ListArgs) -> Result<String> {
    let view = ctx.sent_view()?;
    let shown = args.limit.min(view.entries().len());
    Ok(format_sent(&view.entries()[..shown], ctx.offset()))
}

pub fn recipients(ctx: &CommandContext) -> Result<String> {
    let session = ctx.session()?;
    let letters = ctx
        .store
        .fetch(&LetterFilter::group(&session.group_id))
        .context("loading group letters")?;
    let mut view = ComposeView::new(session);
    view.apply_snapshot(&letters);
    if view.recipients().is_empty() {
        return Ok("No one else has written in this group yet.\n".to_string());
    }
    let mut out = String::new();
    for name in view.recipients() {
        let _ = writeln!(&mut out, "{name}");
    }
    Ok(out)
}

pub fn read(ctx: &CommandContext, args: ReadArgs) -> Result<String> {
    let actions = ctx.actions()?;
    let mut view = ctx.inbox_view()?;
    for id in resolve_ids(&inbox_ids(view.entries()), &args.ids)? {
        view.toggle_selected(&id);
    }
    report_bulk(view.bulk_mark_read(&actions), "Marked read")
}

pub fn delete(ctx: &CommandContext, args: DeleteArgs) -> Result<String> {
    let actions = ctx.actions()?;
    if args.sent {
        let view = ctx.sent_view()?;
        let ids = resolve_ids(&sent_ids(view.entries()), &args.ids)?;
        let outcome = actions.for_each_concurrently(&ids, |actions, id| actions.delete_sent(id));
        return report_bulk(outcome, "Deleted from sent");
    }
    let mut view = ctx.inbox_view()?;
    for id in resolve_ids(&inbox_ids(view.entries()), &args.ids)? {
        view.toggle_selected(&id);
    }
    report_bulk(view.bulk_delete(&actions), "Deleted")
}

pub fn star(ctx: &CommandContext, args: StarArgs) -> Result<String> {
    let actions = ctx.actions()?;
    let view = ctx.inbox_view()?;
    let id = resolve_one(&inbox_ids(view.entries()), &args.id)?;
    let starred = view
        .entries()
        .iter()
        .find(|entry| entry.letter.id == id)
        .map(|entry| !entry.starred)
        .unwrap_or(true);
    actions.set_starred(&id, starred)?;
    Ok(format!(
        "{} {}\n",
        if starred { "Starred" } else { "Unstarred" },
        id.short()
    ))
}

pub fn edit(ctx: &CommandContext, args: EditArgs) -> Result<String> {
    if args.message.is_none() && args.at.is_none() {
        bail!("nothing to change; pass --message and/or --at");
    }
    let actions = ctx.actions()?;
    let view = ctx.sent_view()?;
    let id = resolve_one(&sent_ids(view.entries()), &args.id)?;
    let deliver_at = args
        .at
        .as_deref()
        .map(|at| parse_deliver_at(at, ctx.offset()))
        .transpose()?;
    actions
        .edit(&id, args.message.as_deref(), deliver_at)
        .with_context(|| format!("editing letter {}", id.short()))?;
    Ok(format!("Updated {}\n", id.short()))
}

pub fn export(ctx: &CommandContext, args: ExportArgs) -> Result<String> {
    let mut view = ctx.inbox_view()?;
    if args.all {
        view.select_all();
    } else if args.ids.is_empty() {
        bail!("nothing to export; pass letter ids or --all");
    } else {
        for id in resolve_ids(&inbox_ids(view.entries()), &args.ids)? {
            view.toggle_selected(&id);
        }
    }
    let document = view.export(&ctx.config.export, ctx.offset());
    if document.is_empty() {
        bail!("inbox is empty; nothing to export");
    }
    let path = args
        .out
        .unwrap_or_else(|| ctx.config.export.output_path());
    let written = export::write_document(&document, &path)?;
    Ok(format!(
        "Exported {} letters on {} pages to {}\n",
        document.block_count(),
        document.page_count(),
        written.display()
    ))
}

fn format_inbox(entries: &[InboxEntry], unread: usize, offset: UtcOffset) -> String {
    if entries.is_empty() {
        return "Inbox is empty.\n".to_string();
    }
    let mut out = format!("{unread} unread\n\n");
    for entry in entries {
        let flag = if entry.status.is_read() { "   " } else { "New" };
        let star = if entry.starred { " ★" } else { "" };
        let _ = writeln!(
            &mut out,
            "{}  {flag}  from {}  {}{star}",
            entry.letter.id.short(),
            entry.letter.from,
            display_time(entry.letter.deliver_at, offset)
        );
        push_body(&mut out, &entry.letter.message);
    }
    out
}

fn format_sent(entries: &[SentEntry], offset: UtcOffset) -> String {
    if entries.is_empty() {
        return "No sent letters.\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(
            &mut out,
            "{}  to {}  {}  {}",
            entry.letter.id.short(),
            entry.letter.to,
            display_time(entry.letter.deliver_at, offset),
            entry.status.describe(offset)
        );
        push_body(&mut out, &entry.letter.message);
    }
    out
}

fn push_body(out: &mut String, message: &str) {
    for line in message.lines() {
        let _ = writeln!(out, "    {line}");
    }
    out.push('\n');
}

fn inbox_ids(entries: &[InboxEntry]) -> Vec<&LetterId> {
    entries.iter().map(|entry| &entry.letter.id).collect()
}

fn sent_ids(entries: &[SentEntry]) -> Vec<&LetterId> {
    entries.iter().map(|entry| &entry.letter.id).collect()
}

/// Matches full ids or unique prefixes against the letters the user can see.
fn resolve_ids(known: &[&LetterId], inputs: &[String]) -> Result<Vec<LetterId>> {
    let mut resolved = IndexSet::new();
    for input in inputs {
        resolved.insert(resolve_one(known, input)?);
    }
    Ok(resolved.into_iter().collect())
}

fn resolve_one(known: &[&LetterId], input: &str) -> Result<LetterId> {
    let prefix = input.trim();
    if prefix.is_empty() {
        bail!("letter id cannot be empty");
    }
    if let Some(exact) = known.iter().find(|id| id.as_str() == prefix) {
        return Ok((*exact).clone());
    }
    let mut matches = known.iter().filter(|id| id.as_str().starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(id), None) => Ok((*id).clone()),
        (None, _) => bail!("no visible letter matches {prefix:?}"),
        (Some(_), Some(_)) => bail!("{prefix:?} matches more than one letter; use more characters"),
    }
}

fn report_bulk(outcome: BulkOutcome, verb: &str) -> Result<String> {
    let mut summary = outcome.summary(verb);
    if outcome.all_succeeded() {
        summary.push('\n');
        return Ok(summary);
    }
    for (id, err) in &outcome.failed {
        let _ = write!(&mut summary, "\n  {}: {} ({})", id.short(), err, err.kind());
    }
    Err(anyhow!(summary))
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(Some(buf).filter(|body| !body.trim().is_empty()))
}
