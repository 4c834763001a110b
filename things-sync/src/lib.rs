//! Vault ↔ Things to-do synchronization over URL schemes.
//! The line extractors and the URL codec are pure; everything that touches the
//! editor, the OS URL opener or notifications goes through the `host` traits so
//! the same commands run inside an editor plugin or from the CLI.

pub mod todo {
    //! Value types shared by the extractor, the URL codec and the command layer.

    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};

    /* ------------------------------ To-do ------------------------------ */

    /// A to-do built from a single line, ready to be sent to Things.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoInfo {
        /// Line content with `#tag` tokens removed, trimmed.
        pub title: String,
        /// Comma-joined tag names; configured default tags come last.
        pub tags: String,
        /// `YYYY-MM-DD`-like date (any of `- /.` as separator), or empty.
        pub date: String,
    }

    /* ----------------------------- Target ----------------------------- */

    /// Reference to an existing Things task embedded in a line.
    #[serde_as]
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Target {
        /// Things task id; empty when the line is not tracked.
        pub todo_id: String,
        /// Completion status the task should move to (inverse of the checkbox).
        #[serde_as(as = "DisplayFromStr")]
        pub after_status: bool,
    }

    impl Target {
        pub fn is_tracked(&self) -> bool {
            !self.todo_id.is_empty()
        }
    }

    /* --------------------------- Positions --------------------------- */

    /// Editor position: 0-based line and byte offset within that line.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Position {
        pub line: usize,
        pub ch: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LineRange {
        pub from: Position,
        pub to: Position,
    }

    /// Text to substitute into a single line once Things reports a new task id.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Replacement {
        pub range: LineRange,
        pub text: String,
    }

    impl Replacement {
        /// Splice the replacement into `line_text`. Offsets past the end, or
        /// inside a multi-byte character, are moved back to a char boundary.
        pub fn apply_to(&self, line_text: &str) -> String {
            let from = floor_char_boundary(line_text, self.range.from.ch);
            let to = floor_char_boundary(line_text, self.range.to.ch).max(from);
            let mut out = String::with_capacity(line_text.len() + self.text.len());
            out.push_str(&line_text[..from]);
            out.push_str(&self.text);
            out.push_str(&line_text[to..]);
            out
        }
    }

    fn floor_char_boundary(s: &str, ix: usize) -> usize {
        let mut ix = ix.min(s.len());
        while !s.is_char_boundary(ix) {
            ix -= 1;
        }
        ix
    }

}

pub mod settings {
    //! Plugin settings, persisted as the camelCase JSON object the editor plugin
    //! keeps in its `data.json`.

    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct Settings {
        /// Things URL-scheme auth token; only `update` commands need it.
        pub auth_token: String,
        /// Comma-separated tags appended to every created to-do.
        pub default_tags: String,
        /// Ignore inbound callbacks entirely.
        pub detached_mode: bool,
    }

    impl Settings {
        /// Load settings from `path`; a missing file yields the defaults.
        pub fn load(path: &Path) -> Result<Self> {
            if !path.exists() {
                return Ok(Self::default());
            }
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing settings {:?}", path))
        }

        pub fn save(&self, path: &Path) -> Result<()> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
            }
            let json = serde_json::to_string_pretty(self)?;
            fs::write(path, json.as_bytes()).with_context(|| format!("writing {:?}", path))
        }
    }

}

pub mod extract {
    //! Single-line extractors built on `nom`.
    //!
    //! None of these fail: a line that does not carry a field yields an empty
    //! string (or `false`). Offsets are byte offsets into the given line.

    use crate::todo::Target;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1, take_while, take_while1},
        character::complete::{char, digit1, one_of, satisfy, space1},
        combinator::recognize,
        error::VerboseError,
        sequence::{delimited, preceded, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------------ Title ------------------------------ */

    fn is_lead_markup(c: char) -> bool {
        c.is_whitespace() || matches!(c, '#' | '-' | '[' | ']' | '*')
    }

    fn lead_markup(i: &str) -> PResult<'_, &str> {
        take_while(is_lead_markup)(i)
    }

    /// Byte index of the first character that is not list/checkbox/heading
    /// markup or whitespace. `None` when the line holds nothing else.
    pub fn content_start(line: &str) -> Option<usize> {
        let (rest, _) = lead_markup(line).ok()?;
        if rest.is_empty() {
            None
        } else {
            Some(line.len() - rest.len())
        }
    }

    /// Everything from the content start to the end of the line. Tag tokens are
    /// kept; strip them first with [`strip_tags`] for a tag-free title.
    pub fn extract_title(line: &str) -> String {
        content_start(line)
            .map(|ix| line[ix..].to_string())
            .unwrap_or_default()
    }

    /* ------------------------------- Tags ------------------------------- */

    fn tag_token(i: &str) -> PResult<'_, &str> {
        preceded(char('#'), take_till1(|c: char| c.is_whitespace()))(i)
    }

    /// `(start, end, name)` for every `#tag` token, in order of appearance.
    fn tag_tokens(line: &str) -> Vec<(usize, usize, &str)> {
        let mut out = Vec::new();
        let mut i = line;
        while let Some(pos) = i.find('#') {
            let at = &i[pos..];
            match tag_token(at) {
                Ok((rest, name)) => {
                    out.push((line.len() - at.len(), line.len() - rest.len(), name));
                    i = rest;
                }
                Err(_) => i = &at[1..],
            }
        }
        out
    }

    /// Comma-joined tag names found in `line`, duplicates kept, with
    /// `default_tags` appended as a single entry when non-empty.
    pub fn extract_tags(line: &str, default_tags: &str) -> String {
        let mut tags: Vec<&str> = tag_tokens(line)
            .into_iter()
            .map(|(_, _, name)| name)
            .collect();
        if !default_tags.is_empty() {
            tags.push(default_tags);
        }
        tags.join(",")
    }

    /// `line` with every `#tag` token removed; surrounding spaces are left alone.
    pub fn strip_tags(line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        let mut cursor = 0;
        for (start, end, _) in tag_tokens(line) {
            out.push_str(&line[cursor..start]);
            cursor = end;
        }
        out.push_str(&line[cursor..]);
        out
    }

    /* ------------------------------- Dates ------------------------------- */

    fn digit(i: &str) -> PResult<'_, char> {
        satisfy(|c| c.is_ascii_digit())(i)
    }

    fn year(i: &str) -> PResult<'_, &str> {
        recognize(tuple((alt((tag("19"), tag("20"))), digit, digit)))(i)
    }

    fn month(i: &str) -> PResult<'_, &str> {
        recognize(alt((
            tuple((char('0'), one_of("123456789"))),
            tuple((char('1'), one_of("012"))),
        )))(i)
    }

    // Days-in-month is not checked.
    fn day(i: &str) -> PResult<'_, &str> {
        recognize(alt((
            tuple((char('0'), one_of("123456789"))),
            tuple((one_of("12"), digit)),
            tuple((char('3'), one_of("01"))),
        )))(i)
    }

    fn date(i: &str) -> PResult<'_, &str> {
        let start = i;
        let (i, (_, sep, _)) = tuple((year, one_of("- /."), month))(i)?;
        let (i, _) = tuple((char(sep), day))(i)?;
        Ok((i, &start[..start.len() - i.len()]))
    }

    /// Date at the very start of `text`, or an empty string.
    pub fn extract_date(text: &str) -> String {
        date(text)
            .map(|(_, d)| d.to_string())
            .unwrap_or_default()
    }

    /* ------------------------------ Target ------------------------------ */

    fn todo_id(i: &str) -> PResult<'_, &str> {
        preceded(
            tag("id="),
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        )(i)
    }

    fn checkbox_state(i: &str) -> PResult<'_, char> {
        delimited(char('['), satisfy(|c| c != '\n' && c != '\r'), char(']'))(i)
    }

    /// First position in `line` where `parser` succeeds.
    fn find_first<'a, O>(line: &'a str, parser: impl Fn(&'a str) -> PResult<'a, O>) -> Option<O> {
        line.char_indices()
            .find_map(|(ix, _)| parser(&line[ix..]).ok().map(|(_, out)| out))
    }

    /// Things task id (`id=...` anywhere) and the status a toggle should send.
    /// An unchecked `[ ]` toggles to complete; any other box, or none at all,
    /// toggles to not completed.
    pub fn extract_target(line: &str) -> Target {
        let todo_id = find_first(line, todo_id)
            .map(str::to_string)
            .unwrap_or_default();
        let after_status = matches!(find_first(line, checkbox_state), Some(' '));
        Target {
            todo_id,
            after_status,
        }
    }

    /* --------------------------- Checklist --------------------------- */

    fn bullet(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            alt((
                recognize(one_of("-*+")),
                recognize(tuple((digit1, one_of(".)")))),
            )),
            space1,
        )))(i)
    }

    /// Flip a markdown checklist item: `[ ]` becomes `[x]`, any other mark
    /// becomes `[ ]`. A bullet without a box gains one; a plain line becomes
    /// an unchecked item. Indentation is preserved.
    pub fn toggle_checklist(line: &str) -> String {
        let body = line.trim_start();
        let indent = &line[..line.len() - body.len()];
        let Ok((after_bullet, marker)) = bullet(body) else {
            return format!("{indent}- [ ] {body}");
        };
        // `[a](...)` is a link, not a box: the mark must end the line or be
        // followed by a space
        match checkbox_state(after_bullet) {
            Ok((rest, state)) if rest.is_empty() || rest.starts_with(' ') => {
                let flipped = if state == ' ' { 'x' } else { ' ' };
                format!("{indent}{marker}[{flipped}]{rest}")
            }
            _ => format!("{indent}{marker}[ ] {after_bullet}"),
        }
    }

}

pub mod codec {
    //! Outbound Things command URLs, the vault deep-link, and decoding of the
    //! callback Things opens after creating a task.

    use crate::todo::TodoInfo;
    use indexmap::IndexMap;
    use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
    use url::Url;
    use uuid::Uuid;

    pub const THINGS_SCHEME: &str = "things:///";
    pub const HOST_SCHEME: &str = "obsidian";
    /// Action name the host routes inbound callbacks under.
    pub const CALLBACK_ACTION: &str = "things-sync-id";
    pub const TASK_ID_PARAM: &str = "x-things-id";
    pub const TOKEN_PARAM: &str = "token";

    /// Characters `encodeURIComponent` leaves alone.
    const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
        .remove(b'-')
        .remove(b'_')
        .remove(b'.')
        .remove(b'!')
        .remove(b'~')
        .remove(b'*')
        .remove(b'\'')
        .remove(b'(')
        .remove(b')');

    pub fn url_encode(s: &str) -> String {
        utf8_percent_encode(s, URI_COMPONENT).to_string()
    }

    /// Deep-link into a note. Both arguments must already be percent-encoded.
    pub fn construct_deeplink(file_name: &str, vault_name: &str) -> String {
        format!("{HOST_SCHEME}://open?vault={vault_name}&file={file_name}")
    }

    // Things parses the title raw apart from these two.
    fn encode_title(title: &str) -> String {
        title.replace(' ', "%20").replace('&', "%26")
    }

    /// The callback URL Things should open once the task exists.
    pub fn callback_url(token: Option<Uuid>) -> String {
        match token {
            None => format!("{HOST_SCHEME}://{CALLBACK_ACTION}"),
            Some(token) => format!("{HOST_SCHEME}://{CALLBACK_ACTION}?{TOKEN_PARAM}={token}"),
        }
    }

    fn create_url(todo: &TodoInfo, deep_link: &str, success: &str) -> String {
        format!(
            "{THINGS_SCHEME}add?title={}&notes={deep_link}&when={}&x-success={success}&tags={}",
            encode_title(&todo.title),
            todo.date,
            url_encode(&todo.tags),
        )
    }

    /// `add` URL that asks Things to report the new task id back.
    pub fn build_create_url(todo: &TodoInfo, deep_link: &str) -> String {
        create_url(todo, deep_link, &callback_url(None))
    }

    /// Like [`build_create_url`], with a correlation token in the callback so
    /// the reply can be matched to its line regardless of arrival order.
    pub fn build_create_url_with_token(todo: &TodoInfo, deep_link: &str, token: Uuid) -> String {
        create_url(todo, deep_link, &url_encode(&callback_url(Some(token))))
    }

    /// `add` URL without tags or callback.
    pub fn build_create_from_note_url(todo: &TodoInfo, deep_link: &str) -> String {
        format!(
            "{THINGS_SCHEME}add?title={}&notes={deep_link}&when={}",
            encode_title(&todo.title),
            todo.date,
        )
    }

    /// `update` URL. An empty token is passed through; Things rejects it.
    pub fn build_update_url(todo_id: &str, completed: bool, auth_token: &str) -> String {
        format!("{THINGS_SCHEME}update?id={todo_id}&completed={completed}&auth-token={auth_token}")
    }

    pub fn build_show_url(todo_id: &str) -> String {
        format!("{THINGS_SCHEME}show?id={todo_id}")
    }

    /* --------------------------- Inbound callback --------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum CallbackError {
        #[error("invalid callback url: {0}")]
        InvalidUrl(#[from] url::ParseError),
        #[error("unexpected scheme `{0}`")]
        WrongScheme(String),
        #[error("unexpected action `{0}`")]
        UnknownAction(String),
        #[error("callback is missing `x-things-id`")]
        MissingTaskId,
        #[error("malformed correlation token `{0}`")]
        InvalidToken(String),
    }

    /// Decoded `obsidian://things-sync-id?x-things-id=...` callback.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CallbackRequest {
        pub task_id: String,
        pub token: Option<Uuid>,
        /// Every query parameter, in arrival order, plus `action`.
        pub params: IndexMap<String, String>,
    }

    impl CallbackRequest {
        pub fn parse(raw: &str) -> Result<Self, CallbackError> {
            let url = Url::parse(raw)?;
            if url.scheme() != HOST_SCHEME {
                return Err(CallbackError::WrongScheme(url.scheme().to_string()));
            }
            let action = match url.host_str() {
                Some(host) if !host.is_empty() => host.to_string(),
                _ => url.path().trim_matches('/').to_string(),
            };
            let mut params: IndexMap<String, String> = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            params.insert("action".to_string(), action);
            Self::from_params(params)
        }

        /// Build from an already-split parameter map, as editor protocol
        /// handlers deliver it. A missing `action` is not checked.
        pub fn from_params(params: IndexMap<String, String>) -> Result<Self, CallbackError> {
            if let Some(action) = params.get("action") {
                if action != CALLBACK_ACTION {
                    return Err(CallbackError::UnknownAction(action.clone()));
                }
            }
            let task_id = params
                .get(TASK_ID_PARAM)
                .filter(|id| !id.is_empty())
                .cloned()
                .ok_or(CallbackError::MissingTaskId)?;
            let token = params
                .get(TOKEN_PARAM)
                .map(|raw| Uuid::parse_str(raw).map_err(|_| CallbackError::InvalidToken(raw.clone())))
                .transpose()?;
            Ok(Self {
                task_id,
                token,
                params,
            })
        }
    }

}

pub mod builder {
    //! Turns a raw line into a [`TodoInfo`].

    use crate::extract::{content_start, extract_date, extract_tags, extract_title, strip_tags};
    use crate::settings::Settings;
    use crate::todo::TodoInfo;

    /// Build the to-do for `raw_line`. Tags and date are read before `#tag`
    /// tokens are stripped; the title after. A date at the start of the line's
    /// content wins over one at the start of `file_name`.
    pub fn build_todo(raw_line: &str, settings: &Settings, file_name: &str) -> TodoInfo {
        let line = raw_line.trim();
        let tags = extract_tags(line, &settings.default_tags);

        let content = content_start(line).map(|ix| &line[ix..]).unwrap_or("");
        let mut date = extract_date(content);
        if date.is_empty() {
            date = extract_date(file_name);
        }

        let stripped = strip_tags(line);
        let title = extract_title(&stripped).trim().to_string();

        TodoInfo { title, tags, date }
    }

    /// File name without its `.md` extension.
    pub fn note_stem(file_name: &str) -> &str {
        file_name.strip_suffix(".md").unwrap_or(file_name)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn settings(default_tags: &str) -> Settings {
            Settings {
                default_tags: default_tags.into(),
                ..Settings::default()
            }
        }

        #[test]
        fn filename_date_with_default_tags() {
            let todo = build_todo(
                "Plan trip #travel #2024",
                &settings("Obsidian"),
                "2024-01-10 Notes.md",
            );
            assert_eq!(todo.title, "Plan trip");
            assert_eq!(todo.tags, "travel,2024,Obsidian");
            assert_eq!(todo.date, "2024-01-10");
        }

        #[test]
        fn line_date_wins_over_filename() {
            let todo = build_todo(
                "  - [ ] 2024-03-05 dentist #health ",
                &settings(""),
                "2024-01-10 Notes",
            );
            assert_eq!(todo.date, "2024-03-05");
            assert_eq!(todo.title, "2024-03-05 dentist");
            assert_eq!(todo.tags, "health");
        }

        #[test]
        fn title_never_contains_tags() {
            let todo = build_todo("- [ ] #urgent fix #bug the build", &settings(""), "x");
            assert_eq!(todo.title, "fix  the build");
            assert!(!todo.title.contains('#'));
            assert_eq!(todo.date, "");
        }

        #[test]
        fn leading_date_tag_also_sets_the_date() {
            // `#` is skipped as markup before the date is read
            let todo = build_todo("#2024-01-10 review", &settings(""), "2023-05-01 Old.md");
            assert_eq!(todo.date, "2024-01-10");
            assert_eq!(todo.tags, "2024-01-10");
            assert_eq!(todo.title, "review");
        }

        #[test]
        fn stem_drops_markdown_extension_only() {
            assert_eq!(note_stem("Daily.md"), "Daily");
            assert_eq!(note_stem("Daily.txt"), "Daily.txt");
            assert_eq!(note_stem("a.md.md"), "a.md");
        }
    }
}

pub mod callback {
    //! Rewrites the originating line once Things reports the new task id.

    use crate::codec::build_show_url;
    use crate::extract::content_start;
    use crate::todo::{LineRange, Position, Replacement};

    /// Prefix for lines that carried no list/checkbox markup.
    pub const NEW_TASK_PREFIX: &str = "- [ ] ";

    /// Link the content of `line_text` (editor line `line`) to Things task
    /// `task_id`. Leading markup is preserved; a bare line gets a fresh
    /// unchecked checkbox. The range always ends at the end of the line.
    pub fn resolve_replacement(line_text: &str, line: usize, task_id: &str) -> Replacement {
        let start = content_start(line_text).unwrap_or(line_text.len());
        let link = format!("[{}]({})", &line_text[start..], build_show_url(task_id));
        let text = if start > 0 {
            link
        } else {
            format!("{NEW_TASK_PREFIX}{link}")
        };
        Replacement {
            range: LineRange {
                from: Position { line, ch: start },
                to: Position {
                    line,
                    ch: line_text.len(),
                },
            },
            text,
        }
    }

}

pub mod queue {
    //! Ordered queue of lines whose create URLs went out with a correlation
    //! token and are still waiting for Things to call back.
    //!
    //! Entries are kept in dispatch order. Callbacks are matched by token, so a
    //! reply that overtakes earlier ones still lands on its own line; the entries
    //! it skipped stay queued.

    use anyhow::{Context, Result};
    use chrono::{DateTime, Duration, Utc};
    use serde::{Deserialize, Serialize};
    use std::{collections::VecDeque, fs, path::Path};
    use uuid::Uuid;

    /// Entries older than this are dropped when the queue is loaded.
    pub const MAX_AGE_DAYS: i64 = 7;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PendingEntry {
        pub token: Uuid,
        /// File name of the note the line belongs to.
        #[serde(default)]
        pub file: String,
        /// 0-based editor line the task was created from.
        pub line: usize,
        pub title: String,
        pub dispatched_at: DateTime<Utc>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum QueueError {
        #[error("no pending line for token {0}")]
        UnknownToken(Uuid),
        #[error("token {token} belongs to {expected:?}, not the active note {actual:?}")]
        WrongNote {
            token: Uuid,
            expected: String,
            actual: String,
        },
    }

    /// A matched entry and how many older entries it overtook.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Matched {
        pub entry: PendingEntry,
        pub overtaken: usize,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PendingQueue {
        entries: VecDeque<PendingEntry>,
    }

    impl PendingQueue {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
            self.entries.iter()
        }

        pub fn enqueue(&mut self, file: impl Into<String>, line: usize, title: impl Into<String>) -> Uuid {
            self.enqueue_at(file, line, title, Utc::now())
        }

        pub fn enqueue_at(
            &mut self,
            file: impl Into<String>,
            line: usize,
            title: impl Into<String>,
            now: DateTime<Utc>,
        ) -> Uuid {
            let token = Uuid::new_v4();
            self.entries.push_back(PendingEntry {
                token,
                file: file.into(),
                line,
                title: title.into(),
                dispatched_at: now,
            });
            token
        }

        /// The entry carrying `token`, left in place.
        pub fn get(&self, token: Uuid) -> Result<&PendingEntry, QueueError> {
            self.entries
                .iter()
                .find(|e| e.token == token)
                .ok_or(QueueError::UnknownToken(token))
        }

        /// Remove the entry carrying `token`, wherever it sits.
        pub fn take(&mut self, token: Uuid) -> Result<Matched, QueueError> {
            let ix = self
                .entries
                .iter()
                .position(|e| e.token == token)
                .ok_or(QueueError::UnknownToken(token))?;
            let entry = self
                .entries
                .remove(ix)
                .ok_or(QueueError::UnknownToken(token))?;
            Ok(Matched {
                entry,
                overtaken: ix,
            })
        }

        /// Drop entries dispatched more than `max_age` before `now`.
        pub fn expire_older_than(&mut self, max_age: Duration, now: DateTime<Utc>) -> Vec<PendingEntry> {
            let (expired, kept): (Vec<_>, Vec<_>) = self
                .entries
                .drain(..)
                .partition(|e| now - e.dispatched_at > max_age);
            self.entries = kept.into();
            expired
        }

        /// [`expire_older_than`](Self::expire_older_than) with [`MAX_AGE_DAYS`].
        pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<PendingEntry> {
            self.expire_older_than(Duration::days(MAX_AGE_DAYS), now)
        }

        pub fn load(path: &Path) -> Result<Self> {
            if !path.exists() {
                return Ok(Self::default());
            }
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing pending queue {:?}", path))
        }

        pub fn save(&self, path: &Path) -> Result<()> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
            }
            let json = serde_json::to_string_pretty(self)?;
            fs::write(path, json.as_bytes()).with_context(|| format!("writing {:?}", path))
        }
    }

}

pub mod host {
    //! Capabilities the command layer needs from the surrounding editor.
    //!
    //! `Editor` is the text view, `Host` the application around it. Both are
    //! narrow so the protocol logic can be exercised with [`MemoryEditor`].

    use crate::todo::{LineRange, Position, Replacement};
    use anyhow::Result;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum EditorError {
        #[error("line {0} is out of range")]
        LineOutOfRange(usize),
        #[error("range {from}..{to} does not fit line {line}")]
        InvalidRange { line: usize, from: usize, to: usize },
        #[error("replacement ranges must stay on one line")]
        MultiLine,
    }

    pub trait Editor {
        fn cursor(&self) -> Position;
        fn set_cursor(&mut self, pos: Position);
        fn line(&self, line: usize) -> Option<String>;
        fn line_count(&self) -> usize;
        /// Inclusive line span of the selection when it covers more than one line.
        fn selected_lines(&self) -> Option<(usize, usize)>;
        fn replace_range(&mut self, text: &str, range: LineRange) -> Result<(), EditorError>;
        fn toggle_checklist(&mut self, line: usize) -> Result<(), EditorError>;

        fn current_line(&self) -> String {
            self.line(self.cursor().line).unwrap_or_default()
        }

        fn apply(&mut self, replacement: &Replacement) -> Result<(), EditorError> {
            self.replace_range(&replacement.text, replacement.range)
        }
    }

    pub trait Host {
        /// Name of the active file including extension, e.g. `Daily.md`.
        fn active_file_name(&self) -> Option<String>;
        fn vault_name(&self) -> String;
        /// The active markdown editor, if any.
        fn editor(&mut self) -> Option<&mut dyn Editor>;
        /// Hand a URL to the OS. Fire-and-forget.
        fn open_url(&mut self, url: &str) -> Result<()>;
        fn notify(&mut self, message: &str);
    }

    /* ---------------------------- MemoryEditor ---------------------------- */

    /// A line-oriented document with a cursor and an optional line selection.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MemoryEditor {
        lines: Vec<String>,
        cursor: Position,
        selection: Option<(usize, usize)>,
        trailing_newline: bool,
    }

    impl MemoryEditor {
        pub fn from_text(text: &str) -> Self {
            let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
            if lines.is_empty() {
                lines.push(String::new());
            }
            Self {
                lines,
                cursor: Position::default(),
                selection: None,
                trailing_newline: text.ends_with('\n'),
            }
        }

        pub fn to_text(&self) -> String {
            let mut text = self.lines.join("\n");
            if self.trailing_newline {
                text.push('\n');
            }
            text
        }

        pub fn lines(&self) -> &[String] {
            &self.lines
        }

        pub fn with_cursor(mut self, line: usize) -> Self {
            self.set_cursor(Position { line, ch: 0 });
            self
        }

        /// Select whole lines `anchor..=head` (either order); the cursor moves to `head`.
        pub fn select_lines(&mut self, anchor: usize, head: usize) {
            let last = self.lines.len() - 1;
            let (anchor, head) = (anchor.min(last), head.min(last));
            self.cursor = Position { line: head, ch: 0 };
            self.selection = Some((anchor, head));
        }
    }

    impl Editor for MemoryEditor {
        fn cursor(&self) -> Position {
            self.cursor
        }

        fn set_cursor(&mut self, pos: Position) {
            let line = pos.line.min(self.lines.len() - 1);
            let ch = pos.ch.min(self.lines[line].len());
            self.cursor = Position { line, ch };
            self.selection = None;
        }

        fn line(&self, line: usize) -> Option<String> {
            self.lines.get(line).cloned()
        }

        fn line_count(&self) -> usize {
            self.lines.len()
        }

        fn selected_lines(&self) -> Option<(usize, usize)> {
            let (a, b) = self.selection?;
            (a != b).then(|| (a.min(b), a.max(b)))
        }

        fn replace_range(&mut self, text: &str, range: LineRange) -> Result<(), EditorError> {
            if range.from.line != range.to.line || text.contains('\n') {
                return Err(EditorError::MultiLine);
            }
            let line = range.from.line;
            let current = self
                .lines
                .get_mut(line)
                .ok_or(EditorError::LineOutOfRange(line))?;
            let (from, to) = (range.from.ch, range.to.ch);
            if from > to
                || to > current.len()
                || !current.is_char_boundary(from)
                || !current.is_char_boundary(to)
            {
                return Err(EditorError::InvalidRange { line, from, to });
            }
            current.replace_range(from..to, text);
            Ok(())
        }

        fn toggle_checklist(&mut self, line: usize) -> Result<(), EditorError> {
            let current = self
                .lines
                .get_mut(line)
                .ok_or(EditorError::LineOutOfRange(line))?;
            *current = crate::extract::toggle_checklist(current);
            Ok(())
        }
    }

}

pub mod commands {
    //! The plugin's commands and its callback handler, written against
    //! [`Host`]. Each call reads a fresh line snapshot and returns an
    //! [`Outcome`] describing what it did.

    use crate::builder::{build_todo, note_stem};
    use crate::callback::resolve_replacement;
    use crate::codec::{
        CallbackRequest, build_create_from_note_url, build_create_url, build_create_url_with_token,
        build_update_url, construct_deeplink, url_encode,
    };
    use crate::extract::extract_target;
    use crate::host::{Editor, EditorError, Host};
    use crate::queue::{PendingQueue, QueueError};
    use crate::settings::Settings;
    use crate::todo::{Position, Replacement};
    use anyhow::Result;
    use tracing::{debug, info, warn};

    pub const UNTRACKED_NOTICE: &str = "This is not a things3 todo";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SkipReason {
        NoActiveFile,
        NoEditor,
        Detached,
        NothingToCreate,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outcome {
        Skipped(SkipReason),
        Dispatched(Vec<String>),
        Notified(String),
        Replaced(Replacement),
    }

    /// Plugin state: a settings snapshot and the batch-creation queue.
    #[derive(Debug, Clone, Default)]
    pub struct ThingsSync {
        pub settings: Settings,
        pub pending: PendingQueue,
    }

    /// Percent-encoded deep-link to `file_name` in `vault_name`, encoded once
    /// more for use as a query value.
    fn note_link(file_name: &str, vault_name: &str) -> String {
        let file = url_encode(note_stem(file_name));
        let vault = url_encode(vault_name);
        url_encode(&construct_deeplink(&file, &vault))
    }

    impl ThingsSync {
        pub fn new(settings: Settings) -> Self {
            Self {
                settings,
                pending: PendingQueue::new(),
            }
        }

        pub fn with_pending(settings: Settings, pending: PendingQueue) -> Self {
            Self { settings, pending }
        }

        /// Create a Things to-do from the cursor line, or one per line of a
        /// multi-line selection.
        pub fn create_todo<H: Host + ?Sized>(&mut self, host: &mut H) -> Result<Outcome> {
            let Some(file_name) = host.active_file_name() else {
                return Ok(Outcome::Skipped(SkipReason::NoActiveFile));
            };
            let notes = note_link(&file_name, &host.vault_name());
            let stem = note_stem(&file_name).to_string();
            let Some(editor) = host.editor() else {
                return Ok(Outcome::Skipped(SkipReason::NoEditor));
            };

            let urls = match editor.selected_lines() {
                Some((first, last)) => {
                    let lines: Vec<(usize, String)> = (first..=last)
                        .filter_map(|n| editor.line(n).map(|text| (n, text)))
                        .collect();
                    self.queue_batch(&file_name, lines, &stem, &notes)
                }
                None => {
                    let todo = build_todo(&editor.current_line(), &self.settings, &stem);
                    debug!(?todo, "built todo from cursor line");
                    vec![build_create_url(&todo, &notes)]
                }
            };
            if urls.is_empty() {
                return Ok(Outcome::Skipped(SkipReason::NothingToCreate));
            }

            for url in &urls {
                info!(%url, "dispatching create");
                host.open_url(url)?;
            }
            Ok(Outcome::Dispatched(urls))
        }

        fn queue_batch(
            &mut self,
            file_name: &str,
            lines: Vec<(usize, String)>,
            stem: &str,
            notes: &str,
        ) -> Vec<String> {
            let mut urls = Vec::new();
            for (line, text) in lines {
                let todo = build_todo(&text, &self.settings, stem);
                if todo.title.is_empty() {
                    debug!(line, "skipping blank line in selection");
                    continue;
                }
                let token = self.pending.enqueue(file_name, line, todo.title.clone());
                debug!(line, %token, ?todo, "queued todo");
                urls.push(build_create_url_with_token(&todo, notes, token));
            }
            urls
        }

        /// Toggle the cursor line's checkbox and push the new status to Things.
        pub fn toggle_todo<H: Host + ?Sized>(&mut self, host: &mut H) -> Result<Outcome> {
            if host.active_file_name().is_none() {
                return Ok(Outcome::Skipped(SkipReason::NoActiveFile));
            }
            let Some(editor) = host.editor() else {
                return Ok(Outcome::Skipped(SkipReason::NoEditor));
            };
            let line = editor.cursor().line;
            let target = extract_target(&editor.current_line());
            if !target.is_tracked() {
                host.notify(UNTRACKED_NOTICE);
                return Ok(Outcome::Notified(UNTRACKED_NOTICE.to_string()));
            }
            editor.toggle_checklist(line)?;

            if self.settings.auth_token.is_empty() {
                warn!(todo_id = %target.todo_id, "no auth token configured; Things will reject the update");
            }
            let url = build_update_url(&target.todo_id, target.after_status, &self.settings.auth_token);
            info!(todo_id = %target.todo_id, completed = target.after_status, "dispatching update");
            host.open_url(&url)?;
            host.notify(&format!(
                "{} set completed:{} on things3",
                target.todo_id, target.after_status
            ));
            Ok(Outcome::Dispatched(vec![url]))
        }

        /// Create a Things to-do that points at the active note as a whole.
        pub fn create_todo_from_note<H: Host + ?Sized>(&mut self, host: &mut H) -> Result<Outcome> {
            let Some(file_name) = host.active_file_name() else {
                return Ok(Outcome::Skipped(SkipReason::NoActiveFile));
            };
            if host.editor().is_none() {
                return Ok(Outcome::Skipped(SkipReason::NoEditor));
            }
            let notes = note_link(&file_name, &host.vault_name());
            let stem = note_stem(&file_name);
            let todo = build_todo(stem, &self.settings, stem);
            let url = build_create_from_note_url(&todo, &notes);
            info!(%url, "dispatching create from note");
            host.open_url(&url)?;
            Ok(Outcome::Dispatched(vec![url]))
        }

        /// Rewrite the originating line to link the task Things just created.
        /// Tokened callbacks move the cursor to their queued line first;
        /// tokenless ones apply to the cursor line.
        ///
        /// A queued entry is only removed once its note is the active one and
        /// its line still exists; on any error it stays queued.
        pub fn handle_callback<H: Host + ?Sized>(
            &mut self,
            host: &mut H,
            request: &CallbackRequest,
        ) -> Result<Outcome> {
            if self.settings.detached_mode {
                debug!(task_id = %request.task_id, "detached mode; ignoring callback");
                return Ok(Outcome::Skipped(SkipReason::Detached));
            }
            let active_file = host.active_file_name();
            let Some(editor) = host.editor() else {
                return Ok(Outcome::Skipped(SkipReason::NoEditor));
            };

            if let Some(token) = request.token {
                let entry = self.pending.get(token)?;
                let actual = active_file.unwrap_or_default();
                if entry.file != actual {
                    return Err(QueueError::WrongNote {
                        token,
                        expected: entry.file.clone(),
                        actual,
                    }
                    .into());
                }
                if entry.line >= editor.line_count() {
                    return Err(EditorError::LineOutOfRange(entry.line).into());
                }
                let matched = self.pending.take(token)?;
                if matched.overtaken > 0 {
                    warn!(%token, overtaken = matched.overtaken, "callback arrived ahead of earlier requests");
                }
                editor.set_cursor(Position {
                    line: matched.entry.line,
                    ch: 0,
                });
            }

            let line = editor.cursor().line;
            let replacement = resolve_replacement(&editor.current_line(), line, &request.task_id);
            editor.apply(&replacement)?;
            info!(task_id = %request.task_id, line, "linked line to things task");
            Ok(Outcome::Replaced(replacement))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::codec::{TASK_ID_PARAM, callback_url};
        use crate::host::{Editor, MemoryEditor};

        #[derive(Default)]
        struct TestHost {
            file: Option<String>,
            vault: String,
            editor: Option<MemoryEditor>,
            opened: Vec<String>,
            notices: Vec<String>,
        }

        impl TestHost {
            fn with_note(text: &str, cursor: usize) -> Self {
                Self {
                    file: Some("2024-01-10 Notes.md".into()),
                    vault: "My Vault".into(),
                    editor: Some(MemoryEditor::from_text(text).with_cursor(cursor)),
                    ..Self::default()
                }
            }

            fn text(&self) -> String {
                self.editor.as_ref().map(|e| e.to_text()).unwrap_or_default()
            }
        }

        impl Host for TestHost {
            fn active_file_name(&self) -> Option<String> {
                self.file.clone()
            }

            fn vault_name(&self) -> String {
                self.vault.clone()
            }

            fn editor(&mut self) -> Option<&mut dyn Editor> {
                self.editor.as_mut().map(|e| e as &mut dyn Editor)
            }

            fn open_url(&mut self, url: &str) -> Result<()> {
                self.opened.push(url.to_string());
                Ok(())
            }

            fn notify(&mut self, message: &str) {
                self.notices.push(message.to_string());
            }
        }

        fn plugin() -> ThingsSync {
            ThingsSync::new(Settings {
                auth_token: "tok".into(),
                default_tags: "Obsidian".into(),
                detached_mode: false,
            })
        }

        fn callback(task_id: &str) -> CallbackRequest {
            CallbackRequest::parse(&format!("{}?{TASK_ID_PARAM}={task_id}", callback_url(None)))
                .expect("callback")
        }

        fn tokened_callback(token: uuid::Uuid, task_id: &str) -> CallbackRequest {
            let raw = format!("{}&{TASK_ID_PARAM}={task_id}", callback_url(Some(token)));
            CallbackRequest::parse(&raw).expect("callback")
        }

        /// Batch-create every line of `host`'s note and return the queued tokens.
        fn queue_all(sync: &mut ThingsSync, host: &mut TestHost) -> Vec<uuid::Uuid> {
            let last = host.editor.as_ref().map(|e| e.line_count() - 1).unwrap_or(0);
            if let Some(editor) = host.editor.as_mut() {
                editor.select_lines(0, last);
            }
            sync.create_todo(host).expect("batch");
            sync.pending.iter().map(|e| e.token).collect()
        }

        #[test]
        fn create_dispatches_single_line() {
            let mut host = TestHost::with_note("# Notes\nPlan trip #travel #2024\n", 1);
            let outcome = plugin().create_todo(&mut host).expect("create");

            let expected = "things:///add?title=Plan%20trip\
                &notes=obsidian%3A%2F%2Fopen%3Fvault%3DMy%2520Vault%26file%3D2024-01-10%2520Notes\
                &when=2024-01-10&x-success=obsidian://things-sync-id&tags=travel%2C2024%2CObsidian";
            assert_eq!(outcome, Outcome::Dispatched(vec![expected.to_string()]));
            assert_eq!(host.opened, vec![expected.to_string()]);
        }

        #[test]
        fn create_requires_file_and_editor() {
            let mut no_file = TestHost::with_note("x", 0);
            no_file.file = None;
            assert_eq!(
                plugin().create_todo(&mut no_file).expect("create"),
                Outcome::Skipped(SkipReason::NoActiveFile)
            );

            let mut no_editor = TestHost::with_note("x", 0);
            no_editor.editor = None;
            assert_eq!(
                plugin().create_todo(&mut no_editor).expect("create"),
                Outcome::Skipped(SkipReason::NoEditor)
            );
            assert!(no_file.opened.is_empty() && no_editor.opened.is_empty());
        }

        #[test]
        fn callback_links_cursor_line() {
            let mut host = TestHost::with_note("intro\nCall mom\n", 1);
            let outcome = plugin()
                .handle_callback(&mut host, &callback("ABC"))
                .expect("callback");
            assert!(matches!(outcome, Outcome::Replaced(_)));
            assert_eq!(host.text(), "intro\n- [ ] [Call mom](things:///show?id=ABC)\n");
        }

        #[test]
        fn detached_mode_ignores_callback() {
            let mut host = TestHost::with_note("Call mom", 0);
            let mut sync = plugin();
            sync.settings.detached_mode = true;
            assert_eq!(
                sync.handle_callback(&mut host, &callback("ABC")).expect("callback"),
                Outcome::Skipped(SkipReason::Detached)
            );
            assert_eq!(host.text(), "Call mom");
        }

        #[test]
        fn toggle_untracked_line_only_notifies() {
            let mut host = TestHost::with_note("- [ ] Call mom", 0);
            let outcome = plugin().toggle_todo(&mut host).expect("toggle");
            assert_eq!(outcome, Outcome::Notified(UNTRACKED_NOTICE.to_string()));
            assert!(host.opened.is_empty());
            assert_eq!(host.text(), "- [ ] Call mom");
        }

        #[test]
        fn toggle_tracked_line_flips_and_updates() {
            let mut host = TestHost::with_note("- [ ] [Call mom](things:///show?id=ABC)", 0);
            plugin().toggle_todo(&mut host).expect("toggle");
            assert_eq!(
                host.opened,
                vec!["things:///update?id=ABC&completed=true&auth-token=tok".to_string()]
            );
            assert_eq!(host.text(), "- [x] [Call mom](things:///show?id=ABC)");
            assert_eq!(host.notices, vec!["ABC set completed:true on things3".to_string()]);

            plugin().toggle_todo(&mut host).expect("toggle back");
            assert_eq!(
                host.opened[1],
                "things:///update?id=ABC&completed=false&auth-token=tok"
            );
        }

        #[test]
        fn create_from_note_uses_file_stem() {
            let mut host = TestHost::with_note("anything", 0);
            let outcome = plugin().create_todo_from_note(&mut host).expect("create");
            let urls = match outcome {
                Outcome::Dispatched(urls) => urls,
                other => panic!("expected dispatch, got {:?}", other),
            };
            assert!(urls[0].starts_with("things:///add?title=2024-01-10%20Notes&notes="));
            assert!(urls[0].ends_with("&when=2024-01-10"));
            assert!(!urls[0].contains("x-success"));
        }

        #[test]
        fn batch_callbacks_resolve_in_any_order() {
            let mut host = TestHost::with_note("- one\n\n- two\n- three\n", 0);
            if let Some(editor) = host.editor.as_mut() {
                editor.select_lines(0, 3);
            }
            let mut sync = plugin();
            let Outcome::Dispatched(urls) = sync.create_todo(&mut host).expect("batch") else {
                panic!("expected dispatch");
            };
            assert_eq!(urls.len(), 3);
            assert_eq!(sync.pending.len(), 3);

            let tokens: Vec<_> = sync.pending.iter().map(|e| e.token).collect();
            for (token, url) in tokens.iter().zip(&urls) {
                assert!(url.contains(&token.to_string()));
            }

            // third reply first, then the first, then the second
            for (ix, id) in [(2, "T3"), (0, "T1"), (1, "T2")] {
                let raw = format!("{}&{TASK_ID_PARAM}={id}", callback_url(Some(tokens[ix])));
                let req = CallbackRequest::parse(&raw).expect("callback");
                sync.handle_callback(&mut host, &req).expect("apply");
            }
            assert!(sync.pending.is_empty());
            assert_eq!(
                host.text(),
                "- [one](things:///show?id=T1)\n\n- [two](things:///show?id=T2)\n- [three](things:///show?id=T3)\n"
            );
        }

        #[test]
        fn callback_for_another_note_keeps_both_untouched() {
            let mut source = TestHost::with_note("keep me\nkeep me too\n", 0);
            let mut sync = plugin();
            let tokens = queue_all(&mut sync, &mut source);
            assert_eq!(tokens.len(), 2);
            assert!(sync.pending.iter().all(|e| e.file == "2024-01-10 Notes.md"));

            let mut other = TestHost::with_note("keep me\nkeep me too\n", 0);
            other.file = Some("Other.md".into());
            let err = sync
                .handle_callback(&mut other, &tokened_callback(tokens[0], "ID1"))
                .expect_err("wrong note");
            assert!(matches!(
                err.downcast_ref::<QueueError>(),
                Some(QueueError::WrongNote { .. })
            ));
            assert_eq!(other.text(), "keep me\nkeep me too\n");
            assert_eq!(sync.pending.len(), 2);

            // the entry still resolves once its own note is active again
            sync.handle_callback(&mut source, &tokened_callback(tokens[0], "ID1"))
                .expect("own note");
            assert_eq!(
                source.text(),
                "- [ ] [keep me](things:///show?id=ID1)\nkeep me too\n"
            );
            assert_eq!(sync.pending.len(), 1);
        }

        #[test]
        fn callback_for_vanished_line_keeps_entry() {
            let mut host = TestHost::with_note("a\nb\nc", 0);
            let mut sync = plugin();
            let tokens = queue_all(&mut sync, &mut host);
            assert_eq!(sync.pending.len(), 3);

            host.editor = Some(MemoryEditor::from_text("a"));
            let err = sync
                .handle_callback(&mut host, &tokened_callback(tokens[2], "T3"))
                .expect_err("line gone");
            assert!(matches!(
                err.downcast_ref::<EditorError>(),
                Some(EditorError::LineOutOfRange(2))
            ));
            assert_eq!(sync.pending.len(), 3);
            assert_eq!(host.text(), "a");
        }

        #[test]
        fn detached_mode_leaves_queue_alone() {
            let mut host = TestHost::with_note("one\ntwo", 0);
            let mut sync = plugin();
            let tokens = queue_all(&mut sync, &mut host);
            sync.settings.detached_mode = true;

            assert_eq!(
                sync.handle_callback(&mut host, &tokened_callback(tokens[1], "T2"))
                    .expect("callback"),
                Outcome::Skipped(SkipReason::Detached)
            );
            assert_eq!(sync.pending.len(), 2);
            assert_eq!(host.text(), "one\ntwo");
        }

        #[test]
        fn toggle_keeps_one_char_link_text() {
            let mut host = TestHost::with_note("- a", 0);
            plugin().handle_callback(&mut host, &callback("ABC")).expect("callback");
            assert_eq!(host.text(), "- [a](things:///show?id=ABC)");

            plugin().toggle_todo(&mut host).expect("toggle");
            assert_eq!(host.text(), "- [ ] [a](things:///show?id=ABC)");
            assert_eq!(
                host.opened,
                vec!["things:///update?id=ABC&completed=false&auth-token=tok".to_string()]
            );
        }

        #[test]
        fn unknown_token_is_an_error() {
            let mut host = TestHost::with_note("x", 0);
            let raw = format!(
                "{}&{TASK_ID_PARAM}=T",
                callback_url(Some(uuid::Uuid::new_v4()))
            );
            let req = CallbackRequest::parse(&raw).expect("callback");
            assert!(plugin().handle_callback(&mut host, &req).is_err());
            assert_eq!(host.text(), "x");
        }
    }
}
