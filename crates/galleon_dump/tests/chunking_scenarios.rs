//! Chunker behavior against a scripted server: range splits, region splits,
//! sampling, partitions, concat builds, and raw SQL mode.

mod common;

use common::{fake_conn, rows, FakeServer};
use galleon_dump::chunking::{RegionLookup, TableChunker};
use galleon_dump::config::DumpConfig;
use galleon_dump::server::ServerInfo;
use galleon_dump::task::{ChunkSource, Task, TableMeta};
use tokio_util::sync::CancellationToken;

fn table_meta(database: &str, table: &str, column_count: usize) -> TableMeta {
    TableMeta {
        database: database.to_string(),
        table: table.to_string(),
        column_count,
        ..TableMeta::default()
    }
}

fn data_chunks(tasks: &[Task]) -> Vec<(String, usize, usize)> {
    tasks
        .iter()
        .map(|task| match task {
            Task::TableData {
                chunk,
                chunk_index,
                total_chunks,
                ..
            } => match chunk {
                ChunkSource::SingleQuery { sql, .. } => {
                    (sql.clone(), *chunk_index, *total_chunks)
                }
                ChunkSource::MultiQuery { .. } => {
                    panic!("expected single-query chunk")
                }
            },
            other => panic!("expected data task, got {}", other.brief()),
        })
        .collect()
}

async fn run_chunker(
    config: &DumpConfig,
    server: &std::sync::Arc<FakeServer>,
    meta: &TableMeta,
) -> Vec<Task> {
    let lookup = RegionLookup::Standard;
    let chunker = TableChunker {
        config,
        region_lookup: &lookup,
        cancel: CancellationToken::new(),
    };
    let (sender, mut rx) = common::task_channel(128);
    let mut conn = fake_conn(server);
    chunker
        .dump_table_data(conn.as_mut(), meta, &sender)
        .await
        .unwrap();
    drop(sender);
    common::drain(&mut rx)
}

fn register_pk(server: &FakeServer, field: &str, data_type: &str) {
    server.on(
        "SELECT COLUMN_NAME,DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA='d' AND TABLE_NAME='t' AND COLUMN_KEY='PRI' ORDER BY ORDINAL_POSITION",
        rows(&[&[Some(field), Some(data_type)]]),
    );
}

fn register_no_row_id(server: &FakeServer) {
    server.on_error(
        "SELECT _tidb_rowid FROM `d`.`t` LIMIT 0",
        "Unknown column '_tidb_rowid' in 'field list'",
    );
}

#[tokio::test]
async fn mysql_integer_key_concurrent_chunking() {
    let server = FakeServer::new();
    register_pk(&server, "id", "int");
    server.on(
        "SELECT MIN(`id`),MAX(`id`) FROM `d`.`t`",
        rows(&[&[Some("1"), Some("500")]]),
    );
    server.on_with_columns(
        "EXPLAIN SELECT `id` FROM `d`.`t`",
        &["id", "rows"],
        rows(&[&[Some("1"), Some("500")]]),
    );

    let mut config = DumpConfig {
        rows: Some(100),
        ..DumpConfig::default()
    };
    config.server_info = ServerInfo::parse("8.0.18");
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 1)).await;
    let chunks = data_chunks(&tasks);

    let expected = [
        "SELECT * FROM `d`.`t` WHERE `id` IS NULL OR (`id` >= 1 AND `id` < 101) ORDER BY `id`",
        "SELECT * FROM `d`.`t` WHERE (`id` >= 101 AND `id` < 201) ORDER BY `id`",
        "SELECT * FROM `d`.`t` WHERE (`id` >= 201 AND `id` < 301) ORDER BY `id`",
        "SELECT * FROM `d`.`t` WHERE (`id` >= 301 AND `id` < 401) ORDER BY `id`",
        "SELECT * FROM `d`.`t` WHERE (`id` >= 401 AND `id` < 501) ORDER BY `id`",
    ];
    assert_eq!(chunks.len(), expected.len());
    for (i, ((sql, index, total), expected_sql)) in
        chunks.iter().zip(expected.iter()).enumerate()
    {
        assert_eq!(sql, expected_sql);
        assert_eq!(*index, i);
        assert_eq!(*total, expected.len());
    }

    // Coverage and disjointness over the key domain: every key in [1, 500]
    // falls in exactly one chunk interval.
    let intervals = [(1i64, 101i64), (101, 201), (201, 301), (301, 401), (401, 501)];
    for key in 1..=500i64 {
        let containing = intervals
            .iter()
            .filter(|(lo, hi)| *lo <= key && key < *hi)
            .count();
        assert_eq!(containing, 1, "key {key} covered by {containing} chunks");
    }
}

#[tokio::test]
async fn mysql_low_estimate_dumps_whole_table() {
    let server = FakeServer::new();
    register_pk(&server, "id", "int");
    server.on(
        "SELECT MIN(`id`),MAX(`id`) FROM `d`.`t`",
        rows(&[&[Some("1"), Some("10")]]),
    );
    server.on_with_columns(
        "EXPLAIN SELECT `id` FROM `d`.`t`",
        &["id", "rows"],
        rows(&[&[Some("1"), Some("10")]]),
    );

    let mut config = DumpConfig {
        rows: Some(100),
        ..DumpConfig::default()
    };
    config.server_info = ServerInfo::parse("8.0.18");
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 1)).await;
    let chunks = data_chunks(&tasks);
    assert_eq!(
        chunks,
        vec![("SELECT * FROM `d`.`t` ORDER BY `id`".to_string(), 0, 1)]
    );
}

#[tokio::test]
async fn mysql_empty_table_emits_nothing() {
    let server = FakeServer::new();
    register_pk(&server, "id", "int");
    server.on(
        "SELECT MIN(`id`),MAX(`id`) FROM `d`.`t`",
        rows(&[&[None, None]]),
    );

    let mut config = DumpConfig {
        rows: Some(100),
        ..DumpConfig::default()
    };
    config.server_info = ServerInfo::parse("8.0.18");
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 1)).await;
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn dsql_table_sample_chunking() {
    let server = FakeServer::new();
    register_no_row_id(&server);
    register_pk(&server, "k", "bigint");
    server.on(
        "SELECT `k` FROM `d`.`t` TABLESAMPLE REGIONS() ORDER BY `k`",
        rows(&[&[Some("10")], &[Some("20")], &[Some("30")]]),
    );

    let mut config = DumpConfig {
        rows: Some(100),
        ..DumpConfig::default()
    };
    config.server_info = ServerInfo::parse("8.0.11-TiDB-v5.1.0");
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 1)).await;
    let chunks = data_chunks(&tasks);

    let expected = [
        "SELECT * FROM `d`.`t` WHERE `k`<10 ORDER BY `k`",
        "SELECT * FROM `d`.`t` WHERE `k`>=10 AND `k`<20 ORDER BY `k`",
        "SELECT * FROM `d`.`t` WHERE `k`>=20 AND `k`<30 ORDER BY `k`",
        "SELECT * FROM `d`.`t` WHERE `k`>=30 ORDER BY `k`",
    ];
    assert_eq!(chunks.len(), 4);
    for (i, ((sql, index, total), expected_sql)) in
        chunks.iter().zip(expected.iter()).enumerate()
    {
        assert_eq!(sql, expected_sql);
        assert_eq!(*index, i);
        assert_eq!(*total, 4);
    }
}

#[tokio::test]
async fn dsql_region_decode_chunking() {
    let server = FakeServer::new();
    register_no_row_id(&server);
    register_pk(&server, "k", "bigint");
    server.on(
        "SELECT DISTINCT PARTITION_NAME FROM INFORMATION_SCHEMA.PARTITIONS \
         WHERE TABLE_SCHEMA='d' AND TABLE_NAME='t'",
        rows(&[&[None]]),
    );
    server.on(
        "SELECT START_KEY,tidb_decode_key(START_KEY) FROM INFORMATION_SCHEMA.TIKV_REGION_STATUS \
         WHERE DB_NAME='d' AND TABLE_NAME='t' AND IS_INDEX=0 ORDER BY START_KEY",
        rows(&[
            &[Some("7480000001"), Some("t_45_r")],
            &[Some("7480000002"), Some("t_45_r_tidb_rowid=10")],
            &[Some("7480000003"), Some("t_45_r_tidb_rowid=20")],
        ]),
    );

    let mut config = DumpConfig {
        rows: Some(100),
        ..DumpConfig::default()
    };
    config.server_info = ServerInfo::parse("5.7.25-TiDB-v4.0.11");
    config.server_info.has_distributed_storage = true;
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 1)).await;
    let chunks = data_chunks(&tasks);

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].0, "SELECT * FROM `d`.`t` WHERE `k`<10 ORDER BY `k`");
    assert_eq!(
        chunks[1].0,
        "SELECT * FROM `d`.`t` WHERE `k`>=10 AND `k`<20 ORDER BY `k`"
    );
    assert_eq!(chunks[2].0, "SELECT * FROM `d`.`t` WHERE `k`>=20 ORDER BY `k`");
    assert!(chunks.iter().all(|(_, _, total)| *total == 3));
}

#[tokio::test]
async fn dsql_partitioned_region_chunking() {
    let server = FakeServer::new();
    register_no_row_id(&server);
    register_pk(&server, "k", "bigint");
    server.on(
        "SELECT DISTINCT PARTITION_NAME FROM INFORMATION_SCHEMA.PARTITIONS \
         WHERE TABLE_SCHEMA='d' AND TABLE_NAME='t'",
        rows(&[&[Some("p0")], &[Some("p1")]]),
    );
    server.on_with_columns(
        "SHOW TABLE `d`.`t` PARTITION(`p0`) REGIONS",
        &["REGION_ID", "START_KEY"],
        rows(&[
            &[Some("1"), Some("t_45_")],
            &[Some("2"), Some("t_45_r_5")],
        ]),
    );
    server.on_with_columns(
        "SHOW TABLE `d`.`t` PARTITION(`p1`) REGIONS",
        &["REGION_ID", "START_KEY"],
        rows(&[
            &[Some("3"), Some("t_45_r_5")],
            &[Some("4"), Some("t_45_r_7")],
            &[Some("5"), Some("t_45_r_12")],
        ]),
    );

    let mut config = DumpConfig {
        rows: Some(100),
        ..DumpConfig::default()
    };
    config.server_info = ServerInfo::parse("5.7.25-TiDB-v4.0.11");
    config.server_info.has_distributed_storage = true;
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 1)).await;
    let chunks = data_chunks(&tasks);

    let expected = [
        (
            "SELECT * FROM `d`.`t` PARTITION(`p0`) WHERE `k`<5 ORDER BY `k`",
            0,
        ),
        (
            "SELECT * FROM `d`.`t` PARTITION(`p0`) WHERE `k`>=5 ORDER BY `k`",
            1,
        ),
        (
            "SELECT * FROM `d`.`t` PARTITION(`p1`) WHERE `k`<7 ORDER BY `k`",
            2,
        ),
        (
            "SELECT * FROM `d`.`t` PARTITION(`p1`) WHERE `k`>=7 AND `k`<12 ORDER BY `k`",
            3,
        ),
        (
            "SELECT * FROM `d`.`t` PARTITION(`p1`) WHERE `k`>=12 ORDER BY `k`",
            4,
        ),
    ];
    assert_eq!(chunks.len(), 5);
    for ((sql, index, total), (expected_sql, expected_index)) in
        chunks.iter().zip(expected.iter())
    {
        assert_eq!(sql, expected_sql);
        assert_eq!(index, expected_index);
        assert_eq!(*total, 5, "all partition chunks report the summed total");
    }
}

#[tokio::test]
async fn dsql_sequential_concat_merges_region_selects() {
    let server = FakeServer::new();
    register_no_row_id(&server);
    register_pk(&server, "k", "bigint");
    server.on(
        "SELECT AVG_ROW_LENGTH FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_SCHEMA='d' AND TABLE_NAME='t'",
        rows(&[&[Some("128")]]),
    );
    server.on(
        "SELECT `k` FROM `d`.`t` TABLESAMPLE REGIONS() ORDER BY `k`",
        rows(&[&[Some("10")], &[Some("20")], &[Some("30")]]),
    );

    let mut config = DumpConfig::default();
    config.server_info = ServerInfo::parse("8.0.11-TiDB-v5.1.0");
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 1)).await;

    assert_eq!(tasks.len(), 1);
    let Task::TableData {
        chunk: ChunkSource::MultiQuery { sqls, .. },
        chunk_index,
        total_chunks,
        ..
    } = &tasks[0]
    else {
        panic!("expected one multi-query task, got {}", tasks[0].brief());
    };
    assert_eq!(*chunk_index, 0);
    assert_eq!(*total_chunks, 1);
    assert_eq!(sqls.len(), 4);
    assert_eq!(sqls[0], "SELECT * FROM `d`.`t` WHERE `k`<10 ORDER BY `k`");
    assert_eq!(sqls[3], "SELECT * FROM `d`.`t` WHERE `k`>=30 ORDER BY `k`");
}

#[tokio::test]
async fn dsql_sequential_single_region_falls_back_to_whole_table() {
    let server = FakeServer::new();
    register_no_row_id(&server);
    register_pk(&server, "k", "bigint");
    server.on(
        "SELECT AVG_ROW_LENGTH FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_SCHEMA='d' AND TABLE_NAME='t'",
        rows(&[&[Some("128")]]),
    );
    server.on(
        "SELECT `k` FROM `d`.`t` TABLESAMPLE REGIONS() ORDER BY `k`",
        Vec::new(),
    );

    let mut config = DumpConfig::default();
    config.server_info = ServerInfo::parse("8.0.11-TiDB-v5.1.0");
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 1)).await;
    let chunks = data_chunks(&tasks);
    assert_eq!(
        chunks,
        vec![("SELECT * FROM `d`.`t` ORDER BY `k`".to_string(), 0, 1)]
    );
}

#[tokio::test]
async fn precomputed_region_lookup_overrides_server_decode() {
    let server = FakeServer::new();
    register_no_row_id(&server);
    register_pk(&server, "k", "bigint");
    server.on(
        "SELECT DISTINCT PARTITION_NAME FROM INFORMATION_SCHEMA.PARTITIONS \
         WHERE TABLE_SCHEMA='d' AND TABLE_NAME='t'",
        Vec::new(),
    );

    let mut handles = std::collections::BTreeMap::new();
    handles.insert(("d".to_string(), "t".to_string()), vec![100i64, 200]);
    let lookup = RegionLookup::Precomputed(handles);

    let mut config = DumpConfig {
        rows: Some(100),
        ..DumpConfig::default()
    };
    config.server_info = ServerInfo::parse("8.0.11-TiDB-v3.0.8");
    config.server_info.has_distributed_storage = true;
    let chunker = TableChunker {
        config: &config,
        region_lookup: &lookup,
        cancel: CancellationToken::new(),
    };
    let (sender, mut rx) = common::task_channel(128);
    let mut conn = fake_conn(&server);
    chunker
        .dump_table_data(conn.as_mut(), &table_meta("d", "t", 1), &sender)
        .await
        .unwrap();
    drop(sender);
    let chunks = data_chunks(&common::drain(&mut rx));

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].0, "SELECT * FROM `d`.`t` WHERE `k`<100 ORDER BY `k`");
    assert_eq!(
        chunks[1].0,
        "SELECT * FROM `d`.`t` WHERE `k`>=100 AND `k`<200 ORDER BY `k`"
    );
    assert_eq!(chunks[2].0, "SELECT * FROM `d`.`t` WHERE `k`>=200 ORDER BY `k`");
}

#[tokio::test]
async fn raw_sql_mode_emits_single_task_without_queries() {
    let server = FakeServer::new();
    let config = DumpConfig {
        sql: "SELECT 1".to_string(),
        ..DumpConfig::default()
    };
    let lookup = RegionLookup::Standard;
    let chunker = TableChunker {
        config: &config,
        region_lookup: &lookup,
        cancel: CancellationToken::new(),
    };
    let (sender, mut rx) = common::task_channel(8);
    chunker.dump_raw_sql(&sender).await.unwrap();
    drop(sender);
    let tasks = common::drain(&mut rx);

    assert_eq!(tasks.len(), 1);
    let Task::TableData {
        chunk:
            ChunkSource::SingleQuery {
                sql,
                is_raw,
                ..
            },
        chunk_index,
        total_chunks,
        ..
    } = &tasks[0]
    else {
        panic!("expected a raw data task");
    };
    assert_eq!(sql, "SELECT 1");
    assert!(*is_raw);
    assert_eq!(*chunk_index, 0);
    assert_eq!(*total_chunks, 1);
    assert!(server.executed().is_empty(), "raw mode must not touch the catalog");
}

#[tokio::test]
async fn mysql_without_splittable_field_dumps_whole_table() {
    let server = FakeServer::new();
    // Composite primary key: not splittable.
    server.on(
        "SELECT COLUMN_NAME,DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA='d' AND TABLE_NAME='t' AND COLUMN_KEY='PRI' ORDER BY ORDINAL_POSITION",
        rows(&[&[Some("a"), Some("int")], &[Some("b"), Some("int")]]),
    );

    let mut config = DumpConfig {
        rows: Some(100),
        ..DumpConfig::default()
    };
    config.server_info = ServerInfo::parse("8.0.18");
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 2)).await;
    let chunks = data_chunks(&tasks);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].0, "SELECT * FROM `d`.`t` ORDER BY `a`,`b`");
}

#[tokio::test]
async fn no_data_emits_nothing() {
    let server = FakeServer::new();
    let config = DumpConfig {
        no_data: true,
        rows: Some(100),
        ..DumpConfig::default()
    };
    let tasks = run_chunker(&config, &server, &table_meta("d", "t", 1)).await;
    assert!(tasks.is_empty());
    assert!(server.executed().is_empty());
}
