//! The user-panel directory: task queues, tags, and subject groupings.
//! These are the three ways a batch of cases is discovered besides explicit
//! numbers. Queue/tag listings are cached until the profile changes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use pje_core::scrape::fold_for_match;
use pje_core::{CaseSummary, SessionClient, SubjectGroup, Tag, TaskQueue};

use crate::pace_short;

const TASK_PAGE_SIZE: usize = 100;

#[derive(Default)]
struct DirectoryCache {
    tasks: Option<Vec<TaskQueue>>,
    favourites: Option<Vec<TaskQueue>>,
}

pub struct DirectoryService {
    client: Arc<SessionClient>,
    cache: Mutex<DirectoryCache>,
    ignored_queues: Mutex<HashSet<String>>,
}

impl DirectoryService {
    pub fn new(client: Arc<SessionClient>) -> Self {
        Self {
            client,
            cache: Mutex::new(DirectoryCache::default()),
            ignored_queues: Mutex::new(HashSet::new()),
        }
    }

    /// Must be called after a profile switch; panel contents are per-profile.
    pub fn clear_cache(&self) {
        *lock(&self.cache) = DirectoryCache::default();
        lock(&self.ignored_queues).clear();
    }

    /// Queue names the subject analysis should skip.
    pub fn set_ignored_queues(&self, names: &[String]) {
        let mut ignored = lock(&self.ignored_queues);
        ignored.clear();
        ignored.extend(names.iter().map(|n| fold_for_match(n)));
    }

    // ── Task queues ────────────────────────────────────────────────────────

    /// List queues with pending cases. Cached; empty on failure.
    pub async fn list_tasks(&self, favourites: bool) -> Vec<TaskQueue> {
        {
            let cache = lock(&self.cache);
            let slot = if favourites { &cache.favourites } else { &cache.tasks };
            if let Some(tasks) = slot {
                return tasks.clone();
            }
        }

        let endpoint = if favourites {
            "painelUsuario/tarefasFavoritas"
        } else {
            "painelUsuario/tarefas"
        };
        let payload = json!({"numeroProcesso": "", "competencia": "", "etiquetas": []});
        let tasks = match self.client.api_post(endpoint, &payload).await {
            Ok(resp) if resp.ok() => {
                let mut parsed: Vec<TaskQueue> =
                    serde_json::from_str(&resp.body).unwrap_or_default();
                parsed.retain(|t| t.pending > 0);
                for task in &mut parsed {
                    task.favourite = favourites;
                }
                info!(count = parsed.len(), favourites, "task queues listed");
                parsed
            }
            Ok(resp) => {
                warn!(status = %resp.status, favourites, "task listing rejected");
                Vec::new()
            }
            Err(err) => {
                warn!(%err, favourites, "task listing failed");
                Vec::new()
            }
        };

        if !tasks.is_empty() {
            let mut cache = lock(&self.cache);
            if favourites {
                cache.favourites = Some(tasks.clone());
            } else {
                cache.tasks = Some(tasks.clone());
            }
        }
        tasks
    }

    /// Find a queue by name: accent-insensitive exact match, then substring.
    pub async fn find_task(&self, name: &str, favourites: bool) -> Option<TaskQueue> {
        let tasks = self.list_tasks(favourites).await;
        let folded = fold_for_match(name);

        if let Some(task) = tasks.iter().find(|t| fold_for_match(&t.name) == folded) {
            info!(task = %task.name, "task queue matched");
            return Some(task.clone());
        }
        if let Some(task) = tasks.iter().find(|t| fold_for_match(&t.name).contains(&folded)) {
            info!(task = %task.name, "task queue matched by substring");
            return Some(task.clone());
        }
        warn!(name, "task queue not found");
        None
    }

    /// One page of a queue's cases plus the server-side total.
    async fn task_cases_page(
        &self,
        queue: &str,
        favourites: bool,
        page: usize,
    ) -> (Vec<CaseSummary>, usize) {
        let path = format!(
            "painelUsuario/recuperarProcessosTarefaPendenteComCriterios/{}/{}",
            urlencoding::encode(queue),
            favourites
        );
        let payload = json!({
            "numeroProcesso": "",
            "classe": null,
            "tags": [],
            "page": page,
            "maxResults": TASK_PAGE_SIZE,
            "competencia": "",
        });
        match self.client.api_post(&path, &payload).await {
            Ok(resp) if resp.ok() => {
                let Some(data) = resp.json() else {
                    return (Vec::new(), 0);
                };
                let cases = data
                    .get("entities")
                    .map(|e| serde_json::from_value(e.clone()).unwrap_or_default())
                    .unwrap_or_default();
                let total = data.get("count").and_then(Value::as_u64).unwrap_or(0) as usize;
                (cases, total)
            }
            Ok(resp) => {
                warn!(queue, status = %resp.status, "task case page rejected");
                (Vec::new(), 0)
            }
            Err(err) => {
                warn!(queue, %err, "task case page failed");
                (Vec::new(), 0)
            }
        }
    }

    /// All cases of a queue, paginated until the reported total is reached.
    pub async fn list_task_cases(&self, task: &TaskQueue) -> Vec<CaseSummary> {
        let mut all = Vec::new();
        let mut page = 0;
        loop {
            let (cases, total) = self.task_cases_page(&task.name, task.favourite, page).await;
            if cases.is_empty() {
                break;
            }
            all.extend(cases);
            if all.len() >= total {
                break;
            }
            page += 1;
            pace_short().await;
        }
        debug!(task = %task.name, count = all.len(), "task cases listed");
        all
    }

    // ── Tags ───────────────────────────────────────────────────────────────

    pub async fn search_tags(&self, query: &str) -> Vec<Tag> {
        let payload = json!({"page": 0, "maxResults": 30, "tagsString": query});
        match self.client.api_post("painelUsuario/etiquetas", &payload).await {
            Ok(resp) if resp.ok() => resp
                .json()
                .and_then(|data| {
                    data.get("entities")
                        .map(|e| serde_json::from_value(e.clone()).unwrap_or_default())
                })
                .unwrap_or_default(),
            Ok(resp) => {
                warn!(status = %resp.status, "tag search rejected");
                Vec::new()
            }
            Err(err) => {
                warn!(%err, "tag search failed");
                Vec::new()
            }
        }
    }

    /// Exact (case-insensitive) name match, else the first search hit.
    pub async fn find_tag(&self, name: &str) -> Option<Tag> {
        let tags = self.search_tags(name).await;
        let lowered = name.to_lowercase();
        tags.iter()
            .find(|t| t.name.to_lowercase() == lowered)
            .cloned()
            .or_else(|| tags.into_iter().next())
    }

    pub async fn list_tag_cases(&self, tag: &Tag) -> Vec<CaseSummary> {
        // The total endpoint is cheap and confirms the tag is usable.
        let total_path = format!("painelUsuario/etiquetas/{}/processos/total", tag.id);
        let total = match self.client.api_get(&total_path).await {
            Ok(resp) if resp.ok() => resp.body.trim().parse::<usize>().unwrap_or(0),
            _ => 0,
        };
        info!(tag = %tag.name, total, "tag case count");

        pace_short().await;

        let path = format!("painelUsuario/etiquetas/{}/processos?limit={}", tag.id, total.max(100));
        match self.client.api_get(&path).await {
            Ok(resp) if resp.ok() => serde_json::from_str(&resp.body).unwrap_or_default(),
            Ok(resp) => {
                warn!(tag = %tag.name, status = %resp.status, "tag case listing rejected");
                Vec::new()
            }
            Err(err) => {
                warn!(tag = %tag.name, %err, "tag case listing failed");
                Vec::new()
            }
        }
    }

    // ── Subjects ───────────────────────────────────────────────────────────

    /// Group every non-favourite queue's cases by main subject, largest
    /// group first. Queues in the ignore list are skipped.
    pub async fn group_by_subject(&self) -> Vec<SubjectGroup> {
        let ignored = lock(&self.ignored_queues).clone();
        let queues: Vec<TaskQueue> = self
            .list_tasks(false)
            .await
            .into_iter()
            .filter(|t| !ignored.contains(&fold_for_match(&t.name)))
            .collect();

        info!(queues = queues.len(), "grouping cases by subject");
        let mut groups: Vec<SubjectGroup> = Vec::new();

        for queue in &queues {
            let cases = self.list_task_cases(queue).await;
            for case in cases {
                let subject = if case.main_subject.is_empty() {
                    "Sem assunto definido".to_string()
                } else {
                    case.main_subject.clone()
                };
                match groups.iter_mut().find(|g| g.subject == subject) {
                    Some(group) => group.cases.push(case),
                    None => groups.push(SubjectGroup { subject, cases: vec![case] }),
                }
            }
            pace_short().await;
        }

        groups.sort_by(|a, b| b.cases.len().cmp(&a.cases.len()));
        info!(subjects = groups.len(), "subject grouping done");
        groups
    }

    /// Resolve a subject by substring search over the grouped names.
    pub async fn find_subject(&self, query: &str) -> Option<SubjectGroup> {
        let folded = fold_for_match(query);
        self.group_by_subject()
            .await
            .into_iter()
            .find(|g| fold_for_match(&g.subject).contains(&folded))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
