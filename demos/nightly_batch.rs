use std::path::PathBuf;
use std::sync::Arc;

use journal_analysis_queue::*;
use serde_json::json;

struct CountingProvider;

impl AnalysisProvider for CountingProvider {
    async fn analyze_entry(&self, entry: &JournalEntry) -> Result<AnalysisResult, ProviderError> {
        Ok(AnalysisResult::new(json!({ "entryId": entry.id })))
    }

    async fn analyze_batch(
        &self,
        entries: &[JournalEntry],
    ) -> Result<Vec<AnalysisResult>, ProviderError> {
        println!("Batch request with {} entries", entries.len());
        Ok(entries
            .iter()
            .map(|e| AnalysisResult::new(json!({ "entryId": e.id })))
            .collect())
    }

    async fn update_core(
        &self,
        _entry: &JournalEntry,
        current_state: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        Ok(current_state.clone())
    }
}

struct NullJournal;

impl JournalStore for NullJournal {
    async fn update_entry_with_analysis(
        &self,
        _entry_id: &str,
        _result: &AnalysisResult,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    // Use a persistent database file
    let path = PathBuf::from("/tmp/journal-analysis-queue-example.db");
    let store = Arc::new(SqliteStore::open(Some(&path)).unwrap());

    let scheduler = Scheduler::start(
        SchedulerConfig::default(),
        Arc::new(CountingProvider),
        Arc::new(NullJournal),
        store,
    )
    .unwrap();

    let status = scheduler.queue_status();
    println!(
        "{} deferred entries from previous runs, next flush at {:?}",
        status.deferred_count, status.next_scheduled_flush_time
    );

    for i in 0..12 {
        let entry = JournalEntry::new(format!("entry-{}", i), format!("Entry number {}", i));
        if let Err(e) = scheduler
            .queue_deferred_analysis(entry, AnalysisPriority::Low)
            .await
        {
            println!("Skipped entry-{}: {}", i, e);
        }
    }

    // Normally the nightly timer does this.
    let results = scheduler.force_flush().await.unwrap();
    for result in &results {
        println!(
            "Batch {}: {}/{} succeeded, est. ${:.4}",
            result.batch_id, result.success_count, result.item_count, result.total_estimated_cost
        );
    }

    scheduler.dispose().await.unwrap();
}
