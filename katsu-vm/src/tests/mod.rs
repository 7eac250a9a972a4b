mod dispatch;
mod gc;
mod test_helpers;
