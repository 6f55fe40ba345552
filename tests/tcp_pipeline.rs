use serde_json::{json, Value};
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use live_view_proxy::transport::MessageDecoder;
use live_view_proxy::{
    parse_endpoint, Combiner, CombinerSettings, FrameHeader, FramePublisher, ProxyLoop,
    SharedPublisher, SourceId, SourceSpec, SourceSubscriber, SubscriberConfig, TcpFramePublisher,
};

fn wait_for_consumer(publisher: &mut TcpFramePublisher) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while publisher.subscriber_count() == 0 {
        assert!(Instant::now() < deadline, "subscriber never connected");
        publisher.accept_pending().unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn frames_flow_from_producer_to_consumer_in_order() {
    // Producer side, as frame_sim would run it.
    let mut producer = TcpFramePublisher::bind(&parse_endpoint("tcp://127.0.0.1:0").unwrap()).unwrap();
    let producer_endpoint = producer.endpoint().clone();

    let destination =
        TcpFramePublisher::bind(&parse_endpoint("tcp://127.0.0.1:0").unwrap()).unwrap();
    let destination_addr = destination.endpoint().socket_addr().unwrap();

    let sources = vec![SourceSpec {
        name: "node_1".to_string(),
        endpoint: producer_endpoint.clone(),
    }];
    let settings = CombinerSettings {
        destination: destination.endpoint().to_string(),
        queue_length: 10,
        drop_warn_cutoff: 0.5,
    };
    let destination = SharedPublisher::new(destination);
    let combiner = Arc::new(Mutex::new(Combiner::new(settings, &sources, destination).unwrap()));

    let mut consumer = TcpStream::connect(destination_addr).unwrap();
    consumer
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();

    let (tx, rx) = sync_channel(64);
    let mut sub_config = SubscriberConfig::new(SourceId(0), "node_1", producer_endpoint);
    sub_config.reconnect_backoff = Duration::from_millis(20);
    let subscriber = SourceSubscriber::spawn(sub_config, tx).unwrap();
    wait_for_consumer(&mut producer);

    let shutdown = Arc::new(AtomicBool::new(false));
    let loop_shutdown = shutdown.clone();
    let proxy = ProxyLoop::new(combiner.clone(), rx, Duration::from_millis(1));
    let loop_thread = std::thread::spawn(move || proxy.run(&loop_shutdown));

    for n in 0..5u64 {
        let header = FrameHeader::from_value(json!({
            "frame_num": n,
            "acquisition_id": 0,
            "dtype": "uint8",
            "shape": [4],
        }))
        .unwrap();
        producer.publish(&header, &[n as u8; 4]).unwrap();
    }

    let mut decoder = MessageDecoder::new();
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.len() < 5 && Instant::now() < deadline {
        match consumer.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => decoder.feed(&buf[..n]),
            Err(_) => continue,
        }
        while let Some(parts) = decoder.next_message().unwrap() {
            assert_eq!(parts.len(), 2);
            let header: Value = serde_json::from_slice(&parts[0]).unwrap();
            assert_eq!(header["dtype"], "uint8");
            received.push((header["frame_num"].as_u64().unwrap(), parts[1].clone()));
        }
    }

    let frame_nums: Vec<u64> = received.iter().map(|(n, _)| *n).collect();
    assert_eq!(frame_nums, vec![0, 1, 2, 3, 4]);
    assert_eq!(received[3].1, vec![3u8; 4]);

    shutdown.store(true, Ordering::SeqCst);
    loop_thread.join().unwrap().unwrap();
    subscriber.stop().unwrap();

    let stats = combiner.lock().unwrap().stats();
    assert_eq!(stats.nodes[0].received_frames, 5);
    assert_eq!(stats.dropped_frames, 0);
}
