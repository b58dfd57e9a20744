use rusqlite::Connection;

pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS letters (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            sender TEXT NOT NULL,
            recipient TEXT NOT NULL,
            message TEXT NOT NULL,
            deliver_at INTEGER NOT NULL,
            read_at INTEGER,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS letters_group_recipient
            ON letters (group_id, recipient);
        CREATE INDEX IF NOT EXISTS letters_group_sender
            ON letters (group_id, sender);

        CREATE TABLE IF NOT EXISTS letter_marks (
            letter_id TEXT NOT NULL,
            mark TEXT NOT NULL,
            user_name TEXT NOT NULL,
            PRIMARY KEY (letter_id, mark, user_name),
            FOREIGN KEY (letter_id) REFERENCES letters(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS server_time (
            id INTEGER PRIMARY KEY,
            stamped_at INTEGER NOT NULL
        );
        "#,
    )
}
