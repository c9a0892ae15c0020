use std::time::Duration;

use ndarray::Array2;
use trainer::{
    metrics::{ACC, EpochMetrics, LOSS},
    sync::{ProcessGroup, StoreServer, Synchronizer, TcpStoreClient},
};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn group_of_two() -> (ProcessGroup, ProcessGroup) {
    let server = StoreServer::bind("127.0.0.1:0", 2).await.unwrap();
    let addr = server.local_addr().to_string();

    let (rank0, rank1) = tokio::join!(
        ProcessGroup::connect(0, 2, &addr, Some(server)),
        ProcessGroup::connect(1, 2, &addr, None),
    );

    (rank0.unwrap(), rank1.unwrap())
}

fn metrics_with_accuracy(hits: usize, loss: f32) -> EpochMetrics {
    let rows = 10;
    let mut y_pred = Array2::zeros((rows, 2));
    for row in 0..rows {
        y_pred[[row, usize::from(row >= hits)]] = 1.0;
    }
    let mut y = Array2::zeros((rows, 2));
    y.column_mut(0).fill(1.0);

    let mut metrics = EpochMetrics::new();
    metrics.update(y_pred.view(), y.view(), loss);
    metrics
}

#[tokio::test]
async fn process_group_reduces_epoch_metrics_over_tcp() {
    let (mut rank0, mut rank1) = group_of_two().await;
    assert_eq!((rank0.rank(), rank1.rank()), (0, 1));
    assert_eq!(rank1.world_size(), 2);

    let mut m0 = metrics_with_accuracy(8, 1.0);
    let mut m1 = metrics_with_accuracy(6, 3.0);

    let (a, b) = tokio::join!(
        m0.compute_distributed(&mut rank0, 0, false),
        m1.compute_distributed(&mut rank1, 0, true),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a, b);
    assert!((a.get(ACC) - 0.7).abs() < 1e-6);
    assert!((a.get(LOSS) - 2.0).abs() < 1e-6);
    assert!(a.stop);

    let (a, b) = tokio::join!(rank0.shutdown(), rank1.shutdown());
    a.unwrap();
    b.unwrap();
}

#[tokio::test]
async fn gradients_are_averaged_over_tcp() {
    let (mut rank0, mut rank1) = group_of_two().await;

    for step in 0..3 {
        let mut g0 = [1.0, -2.0, step as f32];
        let mut g1 = [3.0, 2.0, step as f32];
        let key = format!("grad/0/{step}");

        let (a, b) = tokio::join!(
            rank0.all_reduce_mean(&key, &mut g0),
            rank1.all_reduce_mean(&key, &mut g1),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(g0, [2.0, 0.0, step as f32]);
        assert_eq!(g0, g1);
    }

    let (a, b) = tokio::join!(rank0.shutdown(), rank1.shutdown());
    a.unwrap();
    b.unwrap();
}

#[tokio::test]
async fn later_epochs_do_not_read_stale_records() {
    let (mut rank0, mut rank1) = group_of_two().await;

    for (epoch, hits) in [(0, 2), (1, 9)] {
        let mut m0 = metrics_with_accuracy(hits, 0.0);
        let mut m1 = metrics_with_accuracy(hits, 0.0);
        let (a, b) = tokio::join!(
            m0.compute_distributed(&mut rank0, epoch, false),
            m1.compute_distributed(&mut rank1, epoch, false),
        );

        let expected = hits as f32 / 10.0;
        assert!((a.unwrap().get(ACC) - expected).abs() < 1e-6);
        assert!((b.unwrap().get(ACC) - expected).abs() < 1e-6);
    }

    let (a, b) = tokio::join!(rank0.shutdown(), rank1.shutdown());
    a.unwrap();
    b.unwrap();
}

#[tokio::test]
async fn get_waits_for_a_later_set() {
    let server = StoreServer::bind("127.0.0.1:0", 2).await.unwrap();
    let addr = server.local_addr().to_string();

    let mut reader = TcpStoreClient::connect(&addr, 0, TIMEOUT).await.unwrap();
    let mut writer = TcpStoreClient::connect(&addr, 1, TIMEOUT).await.unwrap();
    assert_eq!(reader.world_size(), 2);

    let pending = tokio::spawn(async move {
        let value = reader.get("greeting").await;
        (reader, value)
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    writer.set("greeting", "hello".into()).await.unwrap();

    let (reader, value) = pending.await.unwrap();
    assert_eq!(value.unwrap(), "hello");

    reader.disconnect().await.unwrap();
    writer.disconnect().await.unwrap();
    server.join().await.unwrap();
}

#[tokio::test]
async fn connect_gives_up_after_the_timeout() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let res = TcpStoreClient::connect(&addr, 0, Duration::from_millis(300)).await;
    assert!(res.is_err());
}

#[tokio::test]
async fn mismatched_world_size_is_rejected() {
    let server = StoreServer::bind("127.0.0.1:0", 1).await.unwrap();
    let addr = server.local_addr().to_string();

    let res = ProcessGroup::connect(0, 2, &addr, None).await;
    assert!(matches!(res, Err(trainer::TrainErr::InvalidConfig(_))));
}
