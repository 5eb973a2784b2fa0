//! Content-addressed insert-or-lookup.
//!
//! Every derived artifact is stored once, keyed by the SHA-256 of its
//! canonical byte form. Hash equality is the sole deduplication criterion;
//! callers guarantee canonical bytes before hashing.

use std::borrow::Cow;

use rusqlite::{Connection, OptionalExtension};

/// Replace NUL with U+FFFD in text destined for a TEXT column. Some storage
/// back-ends reject U+0000 in text; the replacement character preserves the
/// rest of the artifact byte-for-byte.
pub fn sanitize_text(s: &str) -> Cow<'_, str> {
    if s.contains('\0') {
        Cow::Owned(s.replace('\0', "\u{FFFD}"))
    } else {
        Cow::Borrowed(s)
    }
}

/// The JSON equivalent: escaped `\u0000` sequences become `\uFFFD` (raw NULs
/// cannot appear in serde output, but sanitize them anyway).
pub fn sanitize_json(s: &str) -> Cow<'_, str> {
    if s.contains("\\u0000") || s.contains('\0') {
        Cow::Owned(s.replace("\\u0000", "\\uFFFD").replace('\0', "\u{FFFD}"))
    } else {
        Cow::Borrowed(s)
    }
}

/// Insert-or-lookup one artifact in `table`, storing the payload in
/// `column`. Returns the row id either way.
///
/// `table` and `column` come from the fixed schema vocabulary, never from
/// input.
pub fn intern_blob(
    conn: &Connection,
    table: &str,
    column: &str,
    hash: &[u8],
    blob: &str,
    is_json: bool,
) -> rusqlite::Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE hash = ?1", table),
            [hash],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let payload = if is_json {
        sanitize_json(blob)
    } else {
        sanitize_text(blob)
    };
    conn.execute(
        &format!("INSERT INTO {} (hash, {}) VALUES (?1, ?2)", table, column),
        rusqlite::params![hash, payload.as_ref()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Intern raw (compressed) HTML. Also reports whether an extraction already
/// exists for this content, so the caller can skip the extraction stage for
/// HTML it has seen before.
///
/// Returns `(content_id, extracted_id_if_any)`.
pub fn intern_html_content(
    conn: &Connection,
    hash: &[u8],
    content: &[u8],
) -> rusqlite::Result<(i64, Option<i64>)> {
    let existing: Option<(i64, Option<i64>)> = conn
        .query_row(
            "SELECT id, extracted FROM capture_html_content WHERE hash = ?1",
            [hash],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some(found) = existing {
        return Ok(found);
    }

    conn.execute(
        "INSERT INTO capture_html_content (hash, content) VALUES (?1, ?2)",
        rusqlite::params![hash, content],
    )?;
    Ok((conn.last_insert_rowid(), None))
}

/// Intern a plaintext artifact together with its segmented form. The
/// segmentation is a derived form of the plaintext, so the pair lives in one
/// row; `None` (the oversized-document case) is stored as NULL.
pub fn intern_plaintext_segmented(
    conn: &Connection,
    hash: &[u8],
    text: &str,
    segmented: Option<&str>,
) -> rusqlite::Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM extracted_plaintext WHERE hash = ?1",
            [hash],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO extracted_plaintext (hash, plaintext, segmented) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            hash,
            sanitize_text(text).as_ref(),
            segmented.map(|s| sanitize_json(s).into_owned()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
