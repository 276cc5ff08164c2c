/// Runs a work loop until the given [tokio_util::sync::CancellationToken] fires. The stop branch
/// is polled first, so a pending stop always wins over pending work.
///
/// Forms:
///  - `recv name, stop_rx, rx => self.handle(it)` awaits `rx.recv()`, ends the loop when the channel closes
///  - `name, stop_rx, source.op(args) => self.handle(it) as simple` passes the output to a sync fn
///  - `... as simple_async` passes the output to an async fn returning `Result`
///  - `... as try_async` for sources yielding `Result<Option<_>>`; `None` just polls again
///
/// The enclosing function must return `anyhow::Result<()>`.
#[macro_export]
macro_rules! loop_with_stop {

(fn_param $work_ident:ident on it) => {
    $work_ident
};
(fn_param $_:ident on $work_arg:ident) => {
    $work_arg
};
(fn_param $_:ident on (&$work_arg:ident)) => {
    &$work_arg
};

(fn_call $($calls:ident).+($($params:tt),*) with $work_arg:ident) => {
    $($calls).+($($crate::loop_with_stop!(fn_param $work_arg on $params)),*)
};

(recv $task_name:expr, $stop_rx:ident, $work_rx:ident => $($calls:ident).+($($params:tt),*)) => {
    $crate::loop_with_stop!($task_name, $stop_rx, $work_rx.recv() => $($calls).+($($params),*) as result_async)
};

($task_name:expr, $stop_rx:ident, $work_rx:ident.$op:ident($($op_args:expr),*) => $($calls:ident).+($($params:tt),*) as $result_type:ident) => {
    loop {
        let work_fut = $work_rx.$op($($op_args),*);
        let stop_fut = $stop_rx.cancelled();

        tokio::select! {
            biased; // Stop should take prio
            _ = stop_fut => {
                log::trace!("Cancellation signal received by {}.", $task_name);
                return anyhow::Result::Ok(());
            }
            work_opt = work_fut => {
                $crate::loop_with_stop!($result_type work_opt for $task_name, $($calls).+($($params),*))
            }
        }
    }
};

(result_async $result_opt:ident for $task_name:expr, $($calls:ident).+($($params:tt),*)) => {
    if let Some(work) = $result_opt {
        $crate::loop_with_stop!(fn_call $($calls).+($($params),*) with work).await?;
    } else {
        log::debug!("Sender closed channel for {}", $task_name);
        return anyhow::Result::Ok(());
    }
};

(simple $result_simple:ident for $task_name:expr, $($calls:ident).+($($params:tt),*)) => {
    $crate::loop_with_stop!(fn_call $($calls).+($($params),*) with $result_simple)
};

(simple_async $result_simple:ident for $task_name:expr, $($calls:ident).+($($params:tt),*)) => {
    $crate::loop_with_stop!(fn_call $($calls).+($($params),*) with $result_simple).await?;
};

(try_async $result_try:ident for $task_name:expr, $($calls:ident).+($($params:tt),*)) => {
    if let Some(work) = $result_try? {
        $crate::loop_with_stop!(fn_call $($calls).+($($params),*) with work).await?;
    }
};
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use assertor::{assert_that, EqualityAssertion};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Counter {
        seen: Vec<u32>,
    }

    impl Counter {
        async fn take(&mut self, value: u32) -> Result<()> {
            self.seen.push(value);
            Ok(())
        }

        async fn drain(&mut self, mut rx: mpsc::UnboundedReceiver<u32>, stop_rx: CancellationToken) -> Result<()> {
            crate::loop_with_stop!(recv "counter", stop_rx, rx => self.take(it))
        }
    }

    #[tokio::test]
    async fn recv_until_closed() {
        // given
        let (tx, rx) = mpsc::unbounded_channel();
        let mut counter = Counter { seen: vec![] };
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        drop(tx);

        // when
        counter.drain(rx, CancellationToken::new()).await.unwrap();

        // then
        assert_that!(counter.seen).is_equal_to(vec![1, 2]);
    }

    #[tokio::test]
    async fn stop_wins_over_work() {
        // given
        let (tx, rx) = mpsc::unbounded_channel();
        let mut counter = Counter { seen: vec![] };
        tx.send(1).unwrap();
        let stop = CancellationToken::new();
        stop.cancel();

        // when
        counter.drain(rx, stop).await.unwrap();

        // then
        assert_that!(counter.seen).is_equal_to(Vec::<u32>::new());
    }
}
