use eegview_compute::device::DeviceId;
use eegview_compute::montage::cache::BinaryCache;
use eegview_compute::{
    build_montages, CommandQueue, ComputeContext, ComputeError, DeviceBuffer, EngineConfig,
    Montage, MontageKind, MontageProcessor, Precision,
};
use std::sync::Arc;
use tempfile::TempDir;

const AVERAGE: &str = "out = in(INDEX) - (in(0) + in(1) + in(2)) / 3;";

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        host_device_memory_mb: 16,
        ..EngineConfig::default()
    }
}

fn repeat(source: &str, count: usize) -> Vec<String> {
    vec![source.to_string(); count]
}

fn run(context: &ComputeContext, montages: &[Montage], channels: usize) -> Vec<f32> {
    let row = 16;
    let queue = CommandQueue::new(context.device()).unwrap();
    let input = DeviceBuffer::<f32>::with_len(context.device(), row * channels).unwrap();
    let output = DeviceBuffer::<f32>::with_len(context.device(), row * montages.len()).unwrap();
    let data = (0..row * channels)
        .map(|i| ((i * 7) % 11) as f32 - 5.0)
        .collect();
    queue.enqueue_write(&input, 0, data).unwrap();

    let processor = MontageProcessor::new(row, channels, 1).unwrap();
    processor
        .process(montages, &input, &output, &queue, row, 0)
        .unwrap()
        .wait()
        .unwrap();
    queue.read_buffer(&output, 0, row * montages.len()).unwrap()
}

#[test]
fn test_identity_never_reaches_the_compiler() {
    let dir = TempDir::new().unwrap();
    let context = ComputeContext::new(config(&dir)).unwrap();
    let sources: Vec<String> = vec![
        "out = in(INDEX);".to_string(),
        "out=in(INDEX)".to_string(),
        "  out  =  in ( INDEX ) ;  ".to_string(),
        "/* identity */ out = in(INDEX); // trailing".to_string(),
        "out =\n\tin(\nINDEX\n);".to_string(),
    ];

    let montages = build_montages(&context, &sources, &[], "").unwrap();
    assert_eq!(context.device().compile_count(), 0);
    for montage in &montages {
        assert_eq!(montage.kind(), MontageKind::Identity);
        assert!(Arc::ptr_eq(montage.kernel(), montages[0].kernel()));
    }
}

#[test]
fn test_copy_variants_share_one_kernel() {
    let dir = TempDir::new().unwrap();
    let context = ComputeContext::new(config(&dir)).unwrap();
    let mut sources = vec!["out = in(42);".to_string()];
    sources.extend((0..99).map(|k| format!("out=in({})", k)));

    let montages = build_montages(&context, &sources, &[], "").unwrap();
    assert!(context.device().compile_count() <= 1);
    assert_eq!(montages[0].kind(), MontageKind::Copy(42));
    assert_eq!(montages[10].kind(), MontageKind::Copy(9));
    assert!(Arc::ptr_eq(montages[0].kernel(), montages[99].kernel()));
}

#[test]
fn test_one_compile_and_one_hit_per_channel() {
    let dir = TempDir::new().unwrap();
    let context = ComputeContext::new(config(&dir)).unwrap();
    let channels = 24;

    let montages = build_montages(&context, &repeat(AVERAGE, channels), &[], "").unwrap();
    assert_eq!(context.device().compile_count(), 1);
    assert_eq!(context.kernel_cache().hits(), channels as u64);
    for montage in &montages {
        assert!(Arc::ptr_eq(montage.kernel(), montages[0].kernel()));
    }

    // a second pass is served entirely from the in-memory cache
    build_montages(&context, &repeat(AVERAGE, channels), &[], "").unwrap();
    assert_eq!(context.device().compile_count(), 1);
    assert_eq!(context.kernel_cache().hits(), 2 * channels as u64);
}

#[test]
fn test_kernel_cache_grows_to_the_channel_count() {
    let dir = TempDir::new().unwrap();
    let context = ComputeContext::new(EngineConfig {
        kernel_cache_size: 2,
        ..config(&dir)
    })
    .unwrap();
    let sources: Vec<String> = (0..6).map(|k| format!("out = in({}) * 2;", k)).collect();

    let montages = build_montages(&context, &sources, &[], "").unwrap();
    assert_eq!(montages.len(), 6);
    assert_eq!(context.device().compile_count(), 6);
    assert_eq!(context.kernel_cache().len(), 6);
    assert_eq!(context.kernel_cache().hits(), 6);
}

#[test]
fn test_stored_binaries_skip_compilation_and_match_output() {
    let dir = TempDir::new().unwrap();
    let header = "float half(float v) { return v / 2; }";
    let sources = vec![
        AVERAGE.to_string(),
        "out = half(in(1)) + y(INDEX);".to_string(),
        "out = in(INDEX);".to_string(),
    ];

    let fresh = {
        let context = ComputeContext::new(config(&dir)).unwrap();
        let montages = build_montages(&context, &sources, &[], header).unwrap();
        assert_eq!(context.device().compile_count(), 2);
        run(&context, &montages, 3)
    };

    let path = dir.path().join(BinaryCache::file_name(DeviceId {
        platform: 0,
        device: 0,
    }));
    let stored = BinaryCache::load(&path, 100).unwrap();
    assert_eq!(stored.len(), 2);

    let context = ComputeContext::new(config(&dir)).unwrap();
    let montages = build_montages(&context, &sources, &[], header).unwrap();
    assert_eq!(context.device().compile_count(), 0);
    assert_eq!(run(&context, &montages, 3), fresh);
}

#[test]
fn test_rejected_binary_is_replaced_by_a_fresh_one() {
    let dir = TempDir::new().unwrap();
    let sources = repeat(AVERAGE, 2);
    {
        let context = ComputeContext::new(config(&dir)).unwrap();
        build_montages(&context, &sources, &[], "").unwrap();
        assert_eq!(context.device().compile_count(), 1);
    }

    let path = dir.path().join(BinaryCache::file_name(DeviceId {
        platform: 0,
        device: 0,
    }));
    let mut stored = BinaryCache::load(&path, 100).unwrap();
    let key = stored.sources()[0].clone();
    stored.insert(key.clone(), b"EVKB\x01garbage".to_vec());
    stored.save().unwrap();

    // the damaged entry is recompiled once and written back
    {
        let context = ComputeContext::new(config(&dir)).unwrap();
        build_montages(&context, &sources, &[], "").unwrap();
        assert_eq!(context.device().compile_count(), 1);
    }
    let healed = BinaryCache::load(&path, 100).unwrap();
    assert_eq!(healed.len(), 1);
    assert!(healed.get(&key).unwrap().len() > 16);

    let context = ComputeContext::new(config(&dir)).unwrap();
    build_montages(&context, &sources, &[], "").unwrap();
    assert_eq!(context.device().compile_count(), 0);
}

#[test]
fn test_persistent_cache_is_bounded() {
    let dir = TempDir::new().unwrap();
    let context = ComputeContext::new(EngineConfig {
        kernel_cache_persistent_size: 2,
        ..config(&dir)
    })
    .unwrap();
    let sources: Vec<String> = (0..3).map(|k| format!("out = in({}) + 1;", k)).collect();
    build_montages(&context, &sources, &[], "").unwrap();
    context.persist_kernel_cache().unwrap();

    let path = context.binary_cache_path().unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["count"], 2);
    let first_source = json["entries"][0]["source"].as_str().unwrap();
    assert!(first_source.contains("in(1) + 1"));
}

#[test]
fn test_validation_does_not_touch_the_persistent_cache() {
    let dir = TempDir::new().unwrap();
    let context = ComputeContext::new(config(&dir)).unwrap();
    let path = context.binary_cache_path().unwrap();

    let kind = Montage::validate(&context, "out = in(0) * in(1);", &[], "").unwrap();
    assert_eq!(kind, MontageKind::Compiled);
    assert_eq!(
        Montage::validate(&context, "out = in(INDEX);", &[], "").unwrap(),
        MontageKind::Identity
    );
    drop(context);
    assert!(!path.exists());
}

#[test]
fn test_compile_errors_carry_the_compiler_log() {
    let dir = TempDir::new().unwrap();
    let context = ComputeContext::new(config(&dir)).unwrap();
    let sources = vec!["out = in(INDEX);".to_string(), "out = in(0) +* 2;".to_string()];

    match build_montages(&context, &sources, &[], "") {
        Err(ComputeError::Compile { log }) => {
            assert!(log.contains("error"));
            assert!(log.contains("out = in(0) + * 2;"));
        }
        other => panic!("expected a compile error, got {:?}", other.map(|m| m.len())),
    }
    assert!(Montage::validate(&context, "out = bogus(1);", &[], "").is_err());

    let nested = format!("out = {}1{};", "(".repeat(1000), ")".repeat(1000));
    match Montage::validate(&context, &nested, &[], "") {
        Err(ComputeError::Compile { log }) => assert!(log.contains("nested too deeply")),
        other => panic!("expected a compile error, got {:?}", other),
    }
}

#[test]
fn test_labels_are_resolved_before_caching() {
    let dir = TempDir::new().unwrap();
    let context = ComputeContext::new(EngineConfig {
        precision: Precision::Double,
        ..config(&dir)
    })
    .unwrap();
    let labels: Vec<String> = ["Fp1", "Fp2", "Cz"].iter().map(|s| s.to_string()).collect();
    let sources = vec![
        "out = in(\"Fp1\") - in(\"Cz\");".to_string(),
        "out = in(0) - in(2);".to_string(),
    ];

    let montages = build_montages(&context, &sources, &labels, "").unwrap();
    assert_eq!(montages[0].source(), montages[1].source());
    assert_eq!(montages[0].precision(), Precision::Double);
    assert_eq!(context.device().compile_count(), 1);
}
