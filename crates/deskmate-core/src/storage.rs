use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use deskmate_types::{Message, MessageRole, Thread};

const THREADS_FILE: &str = "threads.json";
const MESSAGES_FILE: &str = "messages.json";

/// Threads and their messages, cached in memory and written through to JSON files.
pub struct Storage {
    base: PathBuf,
    threads: RwLock<HashMap<String, Thread>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
    flush_lock: Mutex<()>,
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .with_context(|| format!("failed to create storage dir {}", base.display()))?;
        let threads = read_map(&base.join(THREADS_FILE)).await?;
        let messages = read_map(&base.join(MESSAGES_FILE)).await?;
        Ok(Self {
            base,
            threads: RwLock::new(threads),
            messages: RwLock::new(messages),
            flush_lock: Mutex::new(()),
        })
    }

    /// Most recently active first.
    pub async fn list_threads(&self) -> Vec<Thread> {
        let mut threads = self
            .threads
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        threads
    }

    pub async fn get_thread(&self, id: &str) -> Option<Thread> {
        self.threads.read().await.get(id).cloned()
    }

    pub async fn create_thread(&self, title: &str) -> anyhow::Result<Thread> {
        let title = title.trim();
        if title.is_empty() {
            anyhow::bail!("thread title must not be empty");
        }
        let thread = Thread::new(title);
        self.threads
            .write()
            .await
            .insert(thread.id.clone(), thread.clone());
        self.flush().await?;
        Ok(thread)
    }

    /// Oldest first.
    pub async fn list_messages(&self, thread_id: &str) -> Vec<Message> {
        self.messages
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Appends a message and bumps the thread's `updated_at`. `None` when the thread is unknown.
    pub async fn append_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> anyhow::Result<Option<Message>> {
        let mut threads = self.threads.write().await;
        let Some(thread) = threads.get_mut(thread_id) else {
            return Ok(None);
        };
        let message = Message::new(thread_id, role, content);
        thread.updated_at = Utc::now().max(message.created_at);
        self.messages
            .write()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .push(message.clone());
        drop(threads);
        self.flush().await?;
        Ok(Some(message))
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let _guard = self.flush_lock.lock().await;
        let threads = self.threads.read().await.clone();
        let payload = serde_json::to_string_pretty(&threads)?;
        atomic_write(&self.base.join(THREADS_FILE), &payload).await?;
        let messages = self.messages.read().await.clone();
        let payload = serde_json::to_string_pretty(&messages)?;
        atomic_write(&self.base.join(MESSAGES_FILE), &payload).await?;
        Ok(())
    }
}

/// Atomic write using a temp file and rename.
async fn atomic_write(path: &Path, content: &str) -> anyhow::Result<()> {
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, content)
        .await
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("failed to move {} into place", temp_path.display()))?;
    Ok(())
}

/// A file that exists but does not parse is an error, never an empty map.
async fn read_map<T: DeserializeOwned>(path: &Path) -> anyhow::Result<HashMap<String, T>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str::<HashMap<String, T>>(&raw).with_context(|| {
        format!(
            "{} is corrupt; restore or move it aside before starting",
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_base() -> PathBuf {
        std::env::temp_dir().join(format!("deskmate-storage-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn appending_a_message_moves_the_thread_to_the_front() {
        let base = temp_base();
        let storage = Storage::new(&base).await.expect("storage");
        let older = storage.create_thread("older").await.expect("older");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = storage.create_thread("newer").await.expect("newer");
        assert_eq!(storage.list_threads().await[0].id, newer.id);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        storage
            .append_message(&older.id, MessageRole::User, "hello")
            .await
            .expect("append")
            .expect("thread exists");

        let threads = storage.list_threads().await;
        assert_eq!(threads[0].id, older.id);
        assert!(threads[0].updated_at > threads[0].created_at);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn messages_survive_a_reload() {
        let base = temp_base();
        let storage = Storage::new(&base).await.expect("storage");
        let thread = storage.create_thread("diary").await.expect("thread");
        storage
            .append_message(&thread.id, MessageRole::User, "what did I do on Monday?")
            .await
            .expect("append");
        storage
            .append_message(&thread.id, MessageRole::Assistant, "You wrote two reports.")
            .await
            .expect("append");
        drop(storage);

        let reloaded = Storage::new(&base).await.expect("reload");
        let messages = reloaded.list_messages(&thread.id).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].content, "You wrote two reports.");
        assert_eq!(
            reloaded.get_thread(&thread.id).await.map(|t| t.title),
            Some("diary".to_string())
        );
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn truncated_threads_file_is_never_overwritten() {
        let base = temp_base();
        let storage = Storage::new(&base).await.expect("storage");
        storage.create_thread("precious").await.expect("thread");
        drop(storage);

        let threads_path = base.join(THREADS_FILE);
        let full = std::fs::read_to_string(&threads_path).expect("read");
        let torn = &full[..full.len() / 2];
        std::fs::write(&threads_path, torn).expect("truncate");

        let err = Storage::new(&base).await.err().expect("corrupt file must fail to load");
        assert!(format!("{err:#}").contains("threads.json"), "{err:#}");
        assert_eq!(
            std::fs::read_to_string(&threads_path).expect("read"),
            torn,
            "the damaged file stays as it was"
        );
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn flush_leaves_no_temp_files_behind() {
        let base = temp_base();
        let storage = Storage::new(&base).await.expect("storage");
        let thread = storage.create_thread("diary").await.expect("thread");
        storage
            .append_message(&thread.id, MessageRole::User, "hello")
            .await
            .expect("append");

        let mut names = std::fs::read_dir(&base)
            .expect("dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec![MESSAGES_FILE.to_string(), THREADS_FILE.to_string()]);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn unknown_threads_and_blank_titles_are_rejected() {
        let base = temp_base();
        let storage = Storage::new(&base).await.expect("storage");
        assert!(storage.create_thread("   ").await.is_err());
        assert!(storage
            .append_message("missing", MessageRole::User, "hi")
            .await
            .expect("append")
            .is_none());
        assert!(storage.list_messages("missing").await.is_empty());
        let _ = std::fs::remove_dir_all(&base);
    }
}
