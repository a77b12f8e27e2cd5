//! Replies delivered out of order must still reach exactly the caller
//! whose request id they carry.

mod common;

use common::RequestBody;
use mongoflux::bson::DocumentBuilder;
use mongoflux::protocol::{Query, QueryFlags};
use mongoflux::{Config, Driver};

const CALLERS: i32 = 8;

#[tokio::test]
async fn e2e_reverse_order_replies_reach_their_callers() {
    common::init_tracing();
    let (listener, addr) = common::listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Collect every request before answering any of them, then answer
        // in reverse arrival order.
        let mut pending = Vec::new();
        for _ in 0..CALLERS {
            let request = common::read_request(&mut stream).await.unwrap();
            let RequestBody::Query { query, .. } = request.body else {
                panic!("expected a query");
            };
            let marker = query.get_int32("marker").unwrap();
            pending.push((request.header.request_id, marker));
        }
        for (request_id, marker) in pending.into_iter().rev() {
            let doc = DocumentBuilder::new()
                .int32("marker", marker)
                .unwrap()
                .finish()
                .unwrap();
            common::write_reply(&mut stream, request_id, 0, 0, &[doc]).await;
        }
        // Hold the socket open until the driver drains.
        let _ = common::read_request(&mut stream).await;
    });

    let driver = Driver::new(Config::default()).unwrap();
    let supervisor = driver.connect(&addr).unwrap();

    let mut callers = Vec::new();
    for marker in 0..CALLERS {
        let supervisor = supervisor.clone();
        callers.push(tokio::spawn(async move {
            let query = Query {
                namespace: "db.things".into(),
                flags: QueryFlags::empty(),
                number_to_skip: 0,
                number_to_return: -1,
                query: DocumentBuilder::new()
                    .int32("marker", marker)
                    .unwrap()
                    .finish()
                    .unwrap(),
                return_fields: None,
            };
            let reply = supervisor.send(query).await.unwrap();
            assert_eq!(reply.number_returned, 1);
            assert_eq!(reply.documents[0].get_int32("marker"), Ok(marker));
        }));
    }
    for caller in callers {
        caller.await.unwrap();
    }

    supervisor.shutdown().await;
    server.await.unwrap();
}
