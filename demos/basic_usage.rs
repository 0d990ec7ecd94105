use std::sync::Arc;

use journal_analysis_queue::*;
use serde_json::json;

struct EchoProvider;

impl AnalysisProvider for EchoProvider {
    async fn analyze_entry(&self, entry: &JournalEntry) -> Result<AnalysisResult, ProviderError> {
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        Ok(AnalysisResult::new(json!({
            "entryId": entry.id,
            "words": entry.content.split_whitespace().count(),
        })))
    }

    async fn analyze_batch(
        &self,
        entries: &[JournalEntry],
    ) -> Result<Vec<AnalysisResult>, ProviderError> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(self.analyze_entry(entry).await?);
        }
        Ok(results)
    }

    async fn update_core(
        &self,
        entry: &JournalEntry,
        current_state: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let count = current_state["entries"].as_u64().unwrap_or(0);
        Ok(json!({ "entries": count + 1, "lastEntry": entry.id }))
    }
}

struct PrintJournal;

impl JournalStore for PrintJournal {
    async fn update_entry_with_analysis(
        &self,
        entry_id: &str,
        result: &AnalysisResult,
    ) -> anyhow::Result<()> {
        println!("  {} <- {}", entry_id, result.0);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let config = SchedulerConfig::builder()
        .with_max_concurrent(2)
        .with_scheduled_flush(false)
        .build();

    let scheduler = Scheduler::start(
        config,
        Arc::new(EchoProvider),
        Arc::new(PrintJournal),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    let mut handle = scheduler
        .queue_entry_analysis(
            JournalEntry::new("today", "Walked by the river and felt calm."),
            AnalysisPriority::High,
        )
        .await
        .unwrap();

    while let Some(progress) = handle.next_progress().await {
        println!("{} at {:.0}%", progress.task_id, progress.progress);
    }
    println!("Result: {:?}", handle.wait().await);

    let core = scheduler
        .queue_core_updates(JournalEntry::new("today", "..."), json!({ "entries": 41 }))
        .await
        .unwrap();
    println!("Core state: {:?}", core.wait().await);

    println!("Usage: {:?}", scheduler.cost_metrics());
    scheduler.dispose().await.unwrap();
}
